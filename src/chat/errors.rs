use std::time::Duration;

use thiserror::Error;

/// Appended to the error turn shown to the user. Some models reject
/// non-zero penalties so that is the most common fix.
pub const ERROR_REMEDIATION_HINT: &str =
    "\n check if Penalty is enabled for this model or not try setting penalty to 0";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Provider error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("No response received within {}s", .0.as_secs())]
    StreamTimeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A write was based on state older than what is stored
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Failed after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ChatError>,
    },

    #[error("Request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Only upstream failures are worth another attempt. Bad requests
    /// fail the same way every time and timeouts already waited long
    /// enough.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Provider { .. } | ChatError::RateLimitExceeded { .. }
        )
    }

    /// The error underneath any retry wrapping.
    pub fn root(&self) -> &ChatError {
        match self {
            ChatError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        ChatError::Provider {
            status,
            message: err.to_string(),
        }
    }
}

impl From<tokio_rusqlite::Error> for ChatError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}
