//! API routes module

pub mod chat;
pub mod logs;
mod session;
pub mod version;

use std::sync::{Arc, RwLock};

use crate::api::state::AppState;
use axum::Router;

type SharedState = Arc<RwLock<AppState>>;

/// Create the combined API router
pub fn router() -> Router<SharedState> {
    Router::new()
        // Chat completion routes
        .nest("/chat", chat::router())
        // Persisted session routes
        .nest("/session", session::router())
        // Debug log routes
        .nest("/logs", logs::router())
        // Version routes
        .nest("/version", version::router())
}
