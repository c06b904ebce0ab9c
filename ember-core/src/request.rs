use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `stop` may be sent as a single string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopWords {
    One(String),
    Many(Vec<String>),
}

impl Default for StopWords {
    fn default() -> Self {
        StopWords::Many(Vec::new())
    }
}

impl StopWords {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopWords::One(word) => vec![word.clone()],
            StopWords::Many(words) => words.clone(),
        }
    }
}

/// Personalization settings that reshape how the active question is asked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub personalization: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub response: String,
}

impl Instructions {
    pub fn is_blank(&self) -> bool {
        self.personalization.trim().is_empty() && self.response.trim().is_empty()
    }
}

/// Body of a chat-completion or query request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Left unset here; each endpoint applies its own default.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default = "default_repetition_context_size")]
    pub repetition_context_size: usize,
    #[serde(default)]
    pub stop: StopWords,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub instructions: Option<Instructions>,
    #[serde(default)]
    pub role_mapping: Option<HashMap<String, String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> usize {
    100
}

fn default_top_p() -> f64 {
    1.0
}

fn default_repetition_context_size() -> usize {
    20
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: default_max_tokens(),
            temperature: None,
            top_p: default_top_p(),
            repetition_penalty: None,
            repetition_context_size: default_repetition_context_size(),
            stop: StopWords::default(),
            directory: None,
            instructions: None,
            role_mapping: None,
            stream: false,
            model: None,
            seed: None,
        }
    }

    /// Parse a JSON body. Any shape problem is reported as `MalformedRequest`.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(EngineError::MalformedRequest("messages must not be empty".into()));
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(EngineError::MalformedRequest(format!(
                    "temperature must be a non-negative number, got {temperature}"
                )));
            }
        }
        if let Some(penalty) = self.repetition_penalty {
            if !penalty.is_finite() || penalty <= 0.0 {
                return Err(EngineError::MalformedRequest(format!(
                    "repetition_penalty must be a positive number, got {penalty}"
                )));
            }
        }
        if !self.top_p.is_finite() {
            return Err(EngineError::MalformedRequest("top_p must be a finite number".into()));
        }
        if self.stream {
            return Err(EngineError::MalformedRequest("streaming responses are not supported".into()));
        }
        Ok(())
    }

    /// Resolve the sampling parameters, filling temperature with the endpoint default
    pub fn sampling_params(&self, default_temperature: f64) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature.unwrap_or(default_temperature),
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            repetition_context_size: self.repetition_context_size,
            seed: self.seed,
        }
    }
}

/// Sampling parameters for generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: Option<f32>,
    pub repetition_context_size: usize,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            top_p: default_top_p(),
            repetition_penalty: None,
            repetition_context_size: default_repetition_context_size(),
            seed: None,
        }
    }
}

/// Body of `POST /api/init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub model: String,
}

/// Body of `POST /api/index`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    pub directory: String,
}
