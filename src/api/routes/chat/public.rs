//! Public types for the chat API
use serde::{Deserialize, Serialize};

use crate::chat::model_config::{
    DEFAULT_FREQUENCY_PENALTY, DEFAULT_MAX_TOKENS, DEFAULT_PRESENCE_PENALTY, DEFAULT_TEMPERATURE,
    DEFAULT_TOP_P,
};
use crate::chat::{ChatError, ModelConfig, Usage};
use crate::openai::Message;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: Option<RequestConfig>,
}

/// Generation settings sent by the client. Anything left out falls
/// back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    // Signed so that a negative value is reported as invalid rather
    // than failing to parse
    pub max_tokens: Option<i64>,
}

impl RequestConfig {
    pub fn into_model_config(self, default_model: &str) -> Result<ModelConfig, ChatError> {
        let max_tokens = match self.max_tokens {
            None => DEFAULT_MAX_TOKENS,
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ChatError::Validation(format!("maxTokens must be greater than 0, got {}", n))
                })?,
        };
        let config = ModelConfig {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            frequency_penalty: self.frequency_penalty.unwrap_or(DEFAULT_FREQUENCY_PENALTY),
            presence_penalty: self.presence_penalty.unwrap_or(DEFAULT_PRESENCE_PENALTY),
            max_tokens,
            usage: None,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Data of each `token` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenEvent {
    pub delta: String,
}

/// Data of the final `finish` event.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinishEvent {
    pub usage: Option<Usage>,
}

/// Data of an `error` event sent after the stream started.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}
