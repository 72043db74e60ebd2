//! Router for the persisted chat session. Browser clients mirror their
//! local history here so it survives clearing site data.

use std::sync::{Arc, PoisonError, RwLock};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};

use crate::api::public::ApiError;
use crate::api::state::AppState;
use crate::chat::{ChatError, SessionRecord};
use crate::chat::store::BoxedSessionStore;

type SharedState = Arc<RwLock<AppState>>;

fn session_store(state: &SharedState) -> BoxedSessionStore {
    state
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .store
        .clone()
}

async fn session_get(
    State(state): State<SharedState>,
) -> Result<Json<Option<SessionRecord>>, ApiError> {
    let record = session_store(&state).load().await?;
    Ok(Json(record))
}

async fn session_put(
    State(state): State<SharedState>,
    Json(record): Json<SessionRecord>,
) -> Result<StatusCode, ApiError> {
    // Mirrored snapshots can arrive out of order. The client should
    // fetch the stored session again on a conflict.
    if !session_store(&state).save_if_newer(&record).await? {
        return Err(ChatError::Conflict(format!(
            "a session newer than {} is already stored",
            record.timestamp
        ))
        .into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn session_delete(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    session_store(&state).clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the session router
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(session_get).put(session_put).delete(session_delete))
}
