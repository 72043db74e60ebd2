//! Persistence of the single chat session between runs.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::errors::ChatError;
use super::model_config::ModelConfig;
use super::models::Turn;

/// There is exactly one conversation so every record is stored under
/// this key.
pub const SESSION_KEY: &str = "history";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub messages: Vec<Turn>,
    pub model_config: ModelConfig,
    /// Milliseconds since the epoch of the write
    pub timestamp: i64,
}

impl SessionRecord {
    pub fn new(messages: Vec<Turn>, model_config: ModelConfig) -> Self {
        Self {
            messages,
            model_config,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<SessionRecord>, ChatError>;

    /// Replace the stored record. Writes land in the order they are
    /// made, whatever timestamp the record carries.
    async fn save(&self, record: &SessionRecord) -> Result<(), ChatError>;

    /// Replace the stored record unless it is older than the one
    /// already there. Returns false when the write was skipped. For
    /// snapshots mirrored from clients, which can arrive out of order.
    async fn save_if_newer(&self, record: &SessionRecord) -> Result<bool, ChatError>;

    async fn clear(&self) -> Result<(), ChatError>;
}

pub type BoxedSessionStore = Arc<dyn SessionStore>;

/// Timestamp a write is stored with. A writer's clock is never trusted
/// past `now` and every write lands after the previous one, so a record
/// dated in the future can't hold back later saves.
pub fn write_timestamp(requested: i64, previous: Option<i64>, now: i64) -> i64 {
    let requested = requested.min(now);
    match previous {
        Some(previous) => requested.max(previous.min(now) + 1),
        None => requested,
    }
}

/// Whether a snapshot taken at `requested` predates the stored one.
pub fn is_stale(requested: i64, previous: Option<i64>, now: i64) -> bool {
    previous.is_some_and(|previous| requested.min(now) < previous.min(now))
}

/// Store that lives as long as the process, used for throwaway
/// sessions and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write(&self, record: &SessionRecord, only_newer: bool) -> bool {
        let mut current = self.record.lock().await;
        let previous = current.as_ref().map(|r| r.timestamp);
        let now = Utc::now().timestamp_millis();
        if only_newer && is_stale(record.timestamp, previous, now) {
            return false;
        }
        let mut stored = record.clone();
        stored.timestamp = write_timestamp(record.timestamp, previous, now);
        *current = Some(stored);
        true
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Result<Option<SessionRecord>, ChatError> {
        Ok(self.record.lock().await.clone())
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), ChatError> {
        self.write(record, false).await;
        Ok(())
    }

    async fn save_if_newer(&self, record: &SessionRecord) -> Result<bool, ChatError> {
        Ok(self.write(record, true).await)
    }

    async fn clear(&self) -> Result<(), ChatError> {
        *self.record.lock().await = None;
        Ok(())
    }
}
