//! Public types for the logs API
use serde::{Deserialize, Serialize};

use crate::core::logging::{LogEntry, LogLevel};

#[derive(Deserialize)]
pub struct LogsQuery {
    pub level: Option<LogLevel>,
}

#[derive(Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}
