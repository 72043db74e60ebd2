//! Build version, polled by clients to detect that a new version was
//! deployed.

use std::sync::{Arc, RwLock};

use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::state::AppState;

type SharedState = Arc<RwLock<AppState>>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

async fn version_get() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: VERSION.to_string(),
    })
}

/// Create the version router
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(version_get))
}
