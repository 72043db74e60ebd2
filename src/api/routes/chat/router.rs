//! Router for the chat API

use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    response::{IntoResponse, sse::Event, sse::KeepAlive, sse::Sse},
    routing::post,
};
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::public;
use crate::api::public::ApiError;
use crate::api::state::AppState;
use crate::chat::ChatError;
use crate::openai::{CompletionRequest, CompletionStream, StreamEvent};

type SharedState = Arc<RwLock<AppState>>;

fn error_event(err: &ChatError) -> Event {
    let data = json!(public::ErrorEvent {
        message: err.to_string()
    });
    Event::default().event("error").data(data.to_string())
}

// Data is always JSON so tokens with line breaks survive the SSE
// framing
fn token_event(delta: String) -> Event {
    let data = json!(public::TokenEvent { delta });
    Event::default().event("token").data(data.to_string())
}

fn finish_event(usage: Option<crate::chat::Usage>) -> Event {
    let data = json!(public::FinishEvent { usage });
    Event::default().event("finish").data(data.to_string())
}

/// Relay the provider stream as server sent events. The stream fails
/// with a timeout if the provider goes quiet for longer than
/// `stream_timeout`.
fn sse_stream(
    mut stream: CompletionStream,
    stream_timeout: Duration,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match tokio::time::timeout(stream_timeout, stream.next()).await {
                Ok(Some(Ok(StreamEvent::Token(delta)))) => {
                    yield Ok(token_event(delta));
                }
                Ok(Some(Ok(StreamEvent::Finish(usage)))) => {
                    yield Ok(finish_event(usage));
                    break;
                }
                Ok(None) => {
                    yield Ok(finish_event(None));
                    break;
                }
                Ok(Some(Err(err))) => {
                    tracing::error!(error = %err, "Completion stream failed");
                    yield Ok(error_event(&err));
                    break;
                }
                Err(_) => {
                    let err = ChatError::StreamTimeout(stream_timeout);
                    tracing::error!(error = %err, "Completion stream timed out");
                    yield Ok(error_event(&err));
                    break;
                }
            }
        }
    }
}

/// Stream the next assistant message for the given conversation.
/// Invalid requests and failures to reach the provider are returned as
/// a JSON error with a matching status before any event is sent.
async fn chat_handler(
    State(state): State<SharedState>,
    axum::Json(payload): axum::Json<public::ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (backend, retry, default_model, stream_timeout) = {
        let shared_state = state.read().unwrap_or_else(PoisonError::into_inner);
        (
            shared_state.backend.clone(),
            shared_state.retry.detached(),
            shared_state.config.openai_model.clone(),
            shared_state.config.stream_timeout,
        )
    };

    let config = payload
        .config
        .unwrap_or_default()
        .into_model_config(&default_model)?;
    let request = CompletionRequest::new(payload.messages, config)?;

    // Dropping the response ends the request so nothing needs to
    // cancel the retries
    let cancel = CancellationToken::new();
    let stream = retry
        .retry("api chat completion", &cancel, || backend.open(&request))
        .await?;

    let resp = Sse::new(sse_stream(stream, stream_timeout))
        .keep_alive(KeepAlive::default())
        .into_response();

    Ok(resp)
}

/// Create the chat router
pub fn router() -> Router<SharedState> {
    Router::new().route("/", post(chat_handler))
}
