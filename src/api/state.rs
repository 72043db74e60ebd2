use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::chat::RetryPolicy;
use crate::chat::SqliteSessionStore;
use crate::chat::store::BoxedSessionStore;
use crate::core::AppConfig;
use crate::core::logging::{LogBuffer, global_log_buffer};
use crate::openai::{BoxedCompletionBackend, OpenAiBackend};

pub struct AppState {
    pub db: Connection,
    pub config: AppConfig,
    pub backend: BoxedCompletionBackend,
    pub store: BoxedSessionStore,
    pub retry: RetryPolicy,
    pub logs: LogBuffer,
}

impl AppState {
    pub fn new(db: Connection, config: AppConfig) -> Self {
        let backend = Arc::new(OpenAiBackend::new(
            &config.openai_api_hostname,
            &config.openai_api_key,
        ));
        let store = Arc::new(SqliteSessionStore::new(&db));
        Self {
            db,
            config,
            backend,
            store,
            retry: RetryPolicy::default(),
            logs: global_log_buffer().clone(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_buffer(mut self, logs: LogBuffer) -> Self {
        self.logs = logs;
        self
    }
}
