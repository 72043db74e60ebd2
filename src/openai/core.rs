use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::errors::ChatError;
use crate::chat::model_config::ModelConfig;
use crate::chat::models::{Role, Turn, Usage};

/// Sampling is pinned to the single most likely token among the top-p
/// candidates. Not user configurable.
pub const TOP_K: u32 = 1;

/// How long the provider gets to start answering a request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Message {
            role,
            content: content.to_string(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        Message::new(turn.role, &turn.content)
    }
}

/// A validated request for the next assistant turn.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub config: ModelConfig,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, config: ModelConfig) -> Result<Self, ChatError> {
        config.validate()?;
        if messages.is_empty() {
            return Err(ChatError::Validation(
                "messages must not be empty".to_string(),
            ));
        }
        Ok(Self { messages, config })
    }

    /// Build a request from a transcript. Error turns and the empty
    /// placeholder for an answer that hasn't started yet are never
    /// sent to the provider.
    pub fn from_turns(turns: &[Turn], config: ModelConfig) -> Result<Self, ChatError> {
        let messages = turns
            .iter()
            .filter(|t| !t.is_error_turn())
            .filter(|t| !(t.pending && t.content.is_empty()))
            .map(Message::from)
            .collect();
        Self::new(messages, config)
    }

    fn payload(&self) -> CompletionPayload<'_> {
        CompletionPayload {
            model: &self.config.model,
            messages: &self.messages,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            top_k: TOP_K,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

// Serialized directly rather than through `json!` so that f32 values
// go over the wire as written (0.7 and not 0.699999988079071)
#[derive(Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    top_p: f32,
    top_k: u32,
    frequency_penalty: f32,
    presence_penalty: f32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Next piece of assistant content, in order
    Token(String),
    /// End of the response with usage when the provider reported it
    Finish(Option<Usage>),
}

pub type CompletionStream = BoxStream<'static, Result<StreamEvent, ChatError>>;

/// Something that can turn a completion request into a stream of
/// tokens. Opening the stream is the only part that is retried, so
/// implementations should fail in `open` for anything that happens
/// before the first byte of the body.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open(&self, request: &CompletionRequest) -> Result<CompletionStream, ChatError>;
}

pub type BoxedCompletionBackend = Arc<dyn CompletionBackend>;

/// Backend for any OpenAI compatible chat completions API.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_hostname: String,
    api_key: String,
    response_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(api_hostname: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_hostname: api_hostname.to_string(),
            api_key: api_key.to_string(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// How long to wait for the response to start. The body is not
    /// covered, callers bound the gap between chunks instead.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.api_hostname.trim_end_matches("/")
        )
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn open(&self, request: &CompletionRequest) -> Result<CompletionStream, ChatError> {
        tracing::debug!(
            model = %request.config.model,
            messages = request.messages.len(),
            "Opening completion stream"
        );
        let send = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&request.payload())
            .send();
        let response = tokio::time::timeout(self.response_timeout, send)
            .await
            .map_err(|_| {
                ChatError::provider(
                    None,
                    format!(
                        "No response from the provider within {}s",
                        self.response_timeout.as_secs_f32()
                    ),
                )
            })??;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), retry_after, &body);
            tracing::warn!(status = status.as_u16(), error = %err, "Completion request rejected");
            return Err(err);
        }

        Ok(sse_events(response.bytes_stream()))
    }
}

/// Map a non-2xx provider response to the error taxonomy. 429 is kept
/// apart from other client errors so callers can back off from it.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ChatError {
    let message = error_message(body).unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("Request failed with status {}", status)
        } else {
            body.trim().to_string()
        }
    });
    match status {
        429 => ChatError::RateLimitExceeded {
            message,
            retry_after,
        },
        400..=499 => ChatError::Validation(message),
        _ => ChatError::provider(Some(status), message),
    }
}

// OpenAI style `{"error": {"message": "..."}}` bodies
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    describe_error(&value["error"])
}

fn describe_error(error: &Value) -> Option<String> {
    match error {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("message")?.as_str().map(String::from),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ChunkUsage> for Usage {
    fn from(u: ChunkUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    #[serde(default)]
    error: Option<Value>,
}

/// Splits a server sent event body into the data of each event. Lines
/// end in `\n` or `\r\n` and a blank line ends an event. Only `data`
/// fields are kept, multiple data lines of one event are joined with
/// `\n`.
#[derive(Default)]
struct SseDecoder {
    // Bytes rather than a String so a multi-byte character split
    // across two frames is decoded once both halves arrive
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed the next piece of the body, returning the data of every
    /// event it completed.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ChatError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(event) = self.line(&line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// The body ended. A last event that wasn't followed by a blank
    /// line still counts.
    fn finish(&mut self) -> Result<Option<String>, ChatError> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.line(&rest)?;
        }
        Ok(self.dispatch())
    }

    fn line(&mut self, line: &[u8]) -> Result<Option<String>, ChatError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = std::str::from_utf8(line).map_err(|e| {
            ChatError::provider(None, format!("Invalid UTF-8 in completion stream: {}", e))
        })?;

        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

/// Tokens and usage carried by one completion chunk.
fn decode_chunk(data: &str) -> Result<(Vec<String>, Option<Usage>), ChatError> {
    let parsed = serde_json::from_str::<CompletionChunk>(data).map_err(|e| {
        tracing::error!("Parsing completion chunk failed for {}\nError:{}", data, e);
        ChatError::provider(None, format!("Malformed completion chunk: {}", e))
    })?;

    if let Some(err) = parsed.error {
        let message = describe_error(&err).unwrap_or_else(|| err.to_string());
        return Err(ChatError::provider(None, message));
    }
    let tokens = parsed
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .collect();
    Ok((tokens, parsed.usage.map(Usage::from)))
}

/// Decode a server sent event body into stream events. The last event
/// is always `Finish`, carrying the usage from the trailing usage
/// chunk if one was sent.
pub fn sse_events<S, B, E>(body: S) -> CompletionStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ChatError> + Send,
{
    Box::pin(async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::default();
        let mut usage: Option<Usage> = None;
        let mut done = false;

        while !done {
            let events: Vec<String> = match body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(Into::<ChatError>::into)?;
                    decoder.push(chunk.as_ref())?
                }
                None => {
                    done = true;
                    decoder.finish()?.into_iter().collect()
                }
            };

            for data in events {
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    done = true;
                    break;
                }
                let (tokens, chunk_usage) = decode_chunk(data)?;
                if chunk_usage.is_some() {
                    usage = chunk_usage;
                }
                for token in tokens {
                    yield StreamEvent::Token(token);
                }
            }
        }

        yield StreamEvent::Finish(usage);
    })
}
