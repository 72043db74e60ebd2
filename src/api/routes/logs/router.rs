//! Router for the debug log buffer

use std::sync::{Arc, PoisonError, RwLock};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};

use super::public;
use crate::api::public::ApiError;
use crate::api::state::AppState;
use crate::core::logging::LogBuffer;

type SharedState = Arc<RwLock<AppState>>;

fn log_buffer(state: &SharedState) -> LogBuffer {
    state
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .logs
        .clone()
}

async fn logs_get(
    State(state): State<SharedState>,
    Query(params): Query<public::LogsQuery>,
) -> Json<public::LogsResponse> {
    let logs = log_buffer(&state).entries(params.level);
    Json(public::LogsResponse { logs })
}

async fn logs_delete(State(state): State<SharedState>) -> StatusCode {
    log_buffer(&state).clear();
    StatusCode::NO_CONTENT
}

/// Download every buffered entry as a JSON file
async fn logs_export(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let body = log_buffer(&state).export()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"playground-logs.json\"",
            ),
        ],
        body,
    ))
}

/// Create the logs router
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(logs_get).delete(logs_delete))
        .route("/export", get(logs_export))
}
