//! Generation parameters sent with every completion request and the
//! shared handle the session manager reads them through.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::errors::ChatError;
use super::models::Usage;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 1.0;
pub const DEFAULT_FREQUENCY_PENALTY: f32 = 0.0;
pub const DEFAULT_PRESENCE_PENALTY: f32 = 0.0;
pub const DEFAULT_MAX_TOKENS: u32 = 1_000_000;

const SAMPLING_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<Usage>,
}

impl ModelConfig {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            frequency_penalty: DEFAULT_FREQUENCY_PENALTY,
            presence_penalty: DEFAULT_PRESENCE_PENALTY,
            max_tokens: DEFAULT_MAX_TOKENS,
            usage: None,
        }
    }

    /// Range check every parameter. Nothing is clamped, out of range
    /// values are rejected so a request is never sent with settings
    /// the user didn't pick.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.model.trim().is_empty() {
            return Err(ChatError::Validation("model must not be empty".to_string()));
        }
        for (name, value) in [
            ("temperature", self.temperature),
            ("topP", self.top_p),
            ("frequencyPenalty", self.frequency_penalty),
            ("presencePenalty", self.presence_penalty),
        ] {
            if !SAMPLING_RANGE.contains(&value) {
                return Err(ChatError::Validation(format!(
                    "{} must be between 0 and 2, got {}",
                    name, value
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(ChatError::Validation(
                "maxTokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Set a parameter by its display name, used by the REPL `/set`
    /// command. The new value is not validated here.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), ChatError> {
        let parse_f32 = |v: &str| {
            v.parse::<f32>()
                .map_err(|_| ChatError::Validation(format!("{} is not a number", v)))
        };
        match field {
            "model" => self.model = value.to_string(),
            "temperature" => self.temperature = parse_f32(value)?,
            "topP" | "top_p" => self.top_p = parse_f32(value)?,
            "frequencyPenalty" | "frequency_penalty" => self.frequency_penalty = parse_f32(value)?,
            "presencePenalty" | "presence_penalty" => self.presence_penalty = parse_f32(value)?,
            "maxTokens" | "max_tokens" => {
                self.max_tokens = value
                    .parse::<u32>()
                    .map_err(|_| ChatError::Validation(format!("{} is not a count", value)))?
            }
            other => {
                return Err(ChatError::Validation(format!("Unknown setting {}", other)));
            }
        }
        Ok(())
    }
}

/// Shared, observable generation configuration. Cloning the handle
/// shares the underlying state.
#[derive(Clone)]
pub struct ModelConfigState {
    tx: Arc<watch::Sender<ModelConfig>>,
}

impl ModelConfigState {
    pub fn new(config: ModelConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ModelConfig {
        self.tx.borrow().clone()
    }

    /// Replace the whole configuration.
    pub fn set(&self, config: ModelConfig) {
        self.tx.send_replace(config);
    }

    pub fn update(&self, f: impl FnOnce(&mut ModelConfig)) {
        self.tx.send_modify(f);
    }

    pub fn record_usage(&self, usage: Usage) {
        self.tx.send_modify(|c| c.usage = Some(usage));
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelConfig> {
        self.tx.subscribe()
    }
}
