//! The core models for a chat session: turns, the transcript that
//! orders them and rough usage metrics.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed id of the synthetic turn that replaces a failed response.
pub const ERROR_TURN_ID: &str = "error";

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "user")]
    User,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One message in the conversation.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub error: bool,
}

impl Turn {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            usage: None,
            pending: false,
            error: false,
        }
    }

    /// An empty assistant turn that streamed tokens are appended to.
    pub fn pending_assistant() -> Self {
        Self {
            pending: true,
            ..Self::new(Role::Assistant, "")
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            id: ERROR_TURN_ID.to_string(),
            error: true,
            ..Self::new(Role::Assistant, message)
        }
    }

    pub fn is_error_turn(&self) -> bool {
        self.error || self.id == ERROR_TURN_ID
    }
}

/// Approximate token count. This is a heuristic (~4 characters per
/// token) and not a real tokenizer.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4) as u32
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transcript(Vec<Turn>);

impl Transcript {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn new_with_turns(turns: Vec<Turn>) -> Self {
        Self(turns)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<Turn> {
        self.0.clone()
    }

    pub fn push(&mut self, turn: Turn) {
        self.0.push(turn)
    }

    pub fn pop(&mut self) -> Option<Turn> {
        self.0.pop()
    }

    pub fn replace_at(&mut self, index: usize, turn: Turn) -> Option<Turn> {
        self.0
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, turn))
    }

    /// Drop every turn after `index`, keeping `index` itself.
    pub fn truncate_after(&mut self, index: usize) {
        self.0.truncate(index + 1)
    }

    pub fn replace_all(&mut self, turns: Vec<Turn>) {
        self.0 = turns
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.0.iter().position(|t| t.id == id)
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.0.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Turn> {
        self.0.get_mut(index)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.0.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Turn> {
        self.0.last_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.0.iter()
    }

    pub fn estimated_tokens(&self) -> u32 {
        self.0.iter().map(|t| estimate_tokens(&t.content)).sum()
    }
}

/// Rough throughput numbers shown next to the conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetrics {
    pub total_tokens: u32,
    pub tokens_per_second: f64,
    pub estimated_completion_time: f64,
}

impl ChatMetrics {
    /// `completion_times` are seconds spent generating each assistant
    /// turn that finished.
    pub fn from_transcript(transcript: &Transcript, completion_times: &[f64]) -> Self {
        let total_tokens = transcript.estimated_tokens();
        let generated: u32 = transcript
            .iter()
            .filter(|t| t.role == Role::Assistant && !t.is_error_turn())
            .map(|t| {
                t.usage
                    .map(|u| u.completion_tokens)
                    .unwrap_or_else(|| estimate_tokens(&t.content))
            })
            .sum();
        let seconds: f64 = completion_times.iter().sum();

        let tokens_per_second = if seconds > 0.0 {
            generated as f64 / seconds
        } else {
            0.0
        };
        let estimated_completion_time = if tokens_per_second > 0.0 {
            total_tokens as f64 / tokens_per_second
        } else {
            0.0
        };

        Self {
            total_tokens,
            tokens_per_second,
            estimated_completion_time,
        }
    }
}
