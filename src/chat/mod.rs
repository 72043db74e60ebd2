mod core;
pub mod db;
pub mod errors;
pub mod model_config;
pub mod models;
pub mod retry;
pub mod store;

pub use self::core::{
    ChatSession, ChatSessionBuilder, SessionEvent, SessionStatus, StopHandle, SubmitOutcome,
};
pub use db::SqliteSessionStore;
pub use errors::ChatError;
pub use model_config::{ModelConfig, ModelConfigState};
pub use models::{ChatMetrics, Role, Transcript, Turn, Usage};
pub use retry::RetryPolicy;
pub use store::{InMemorySessionStore, SessionRecord, SessionStore};
