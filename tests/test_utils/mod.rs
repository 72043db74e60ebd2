//! Test utilities for integration tests
#![allow(dead_code)]

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{Router, body::Body};

use playground::api::AppState;
use playground::api::app;
use playground::chat::RetryPolicy;
use playground::core::AppConfig;
use playground::core::db::async_db;
use playground::core::db::initialize_db;
use playground::core::logging::LogBuffer;

/// Host that refuses connections, for tests that never reach the
/// provider.
pub const UNREACHABLE_HOST: &str = "http://127.0.0.1:1";

/// Creates a test application router backed by a fresh database in a
/// temporary directory. Provider requests go to `llm_host` and log
/// entries are captured in `logs` instead of the global buffer.
pub async fn test_app_with(llm_host: &str, logs: LogBuffer) -> Router {
    let dir = tempfile::tempdir()
        .expect("Failed to create temp directory")
        .keep();
    let web_dir = dir.join("web");
    std::fs::create_dir_all(&web_dir).expect("Failed to create web directory");
    std::fs::write(web_dir.join("index.html"), "<html>playground</html>")
        .expect("Failed to write index.html");

    let db_path = dir.join("db");
    let db = async_db(db_path.to_str().unwrap())
        .await
        .expect("Failed to connect to async db");
    db.call(|conn| {
        initialize_db(conn).expect("Failed to migrate db");
        Ok(())
    })
    .await
    .unwrap();

    let app_config = AppConfig {
        storage_path: dir.display().to_string(),
        db_path: db_path.display().to_string(),
        web_dir: web_dir.display().to_string(),
        openai_model: String::from("gpt-4.1-mini"),
        openai_api_hostname: llm_host.to_string(),
        openai_api_key: String::from("test-api-key"),
        stream_timeout: Duration::from_secs(5),
        server_url: None,
    };
    let app_state = AppState::new(db, app_config)
        .with_retry_policy(RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2,
        ))
        .with_log_buffer(logs);
    app(Arc::new(RwLock::new(app_state)))
}

pub async fn test_app() -> Router {
    test_app_with(UNREACHABLE_HOST, LogBuffer::new()).await
}

pub async fn body_to_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Failed to read body");
    String::from_utf8(bytes.to_vec()).expect("Body is not UTF-8")
}
