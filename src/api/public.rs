//! Public API types

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::json;

use crate::chat::ChatError;

// Errors

pub struct ApiError(anyhow::Error);

impl ApiError {
    /// Client errors are the caller's to fix, upstream failures are
    /// reported as a bad or timed out gateway.
    pub fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>().map(ChatError::root) {
            Some(ChatError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ChatError::RateLimitExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Some(ChatError::Conflict(_)) => StatusCode::CONFLICT,
            Some(ChatError::Provider { .. }) => StatusCode::BAD_GATEWAY,
            Some(ChatError::StreamTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert `ApiError` into an Axum compatible response.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Always log the error
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        } else {
            tracing::warn!("{}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Enables using `?` on functions that return `Result<_,
/// anyhow::Error>` (or `ChatError`) to turn them into `Result<_,
/// ApiError>`
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

// Re-export public types from each route

pub mod chat {
    pub use crate::api::routes::chat::public::*;
}

pub mod logs {
    pub use crate::api::routes::logs::public::*;
}
