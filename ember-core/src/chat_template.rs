//! Chat prompt rendering
//!
//! Models that ship a Jinja `chat_template` in `tokenizer_config.json` are rendered
//! with minijinja. Everything else falls back to plain role prefixes.

use minijinja::{context, Environment, ErrorKind};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::request::ChatMessage;

/// Rendered prompt text plus how it must be tokenized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub text: String,
    /// Templates insert their own special tokens; plain prompts rely on the tokenizer.
    pub add_special_tokens: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTemplate {
    Jinja {
        source: String,
        bos_token: Option<String>,
        eos_token: Option<String>,
    },
    Plain,
}

impl ChatTemplate {
    /// Read the template and special tokens from a `tokenizer_config.json`
    pub fn from_tokenizer_config(path: &Path) -> anyhow::Result<Self> {
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(Self::from_config_json(&json))
    }

    pub fn from_config_json(json: &serde_json::Value) -> Self {
        match json.get("chat_template").and_then(|v| v.as_str()) {
            Some(source) => ChatTemplate::Jinja {
                source: source.to_string(),
                bos_token: special_token(json.get("bos_token")),
                eos_token: special_token(json.get("eos_token")),
            },
            None => ChatTemplate::Plain,
        }
    }

    pub fn eos_token(&self) -> Option<&str> {
        match self {
            ChatTemplate::Jinja { eos_token, .. } => eos_token.as_deref(),
            ChatTemplate::Plain => None,
        }
    }

    /// Render a conversation, ending with the assistant generation prompt.
    /// `role_mapping` only affects the plain fallback.
    pub fn render(&self, messages: &[ChatMessage], role_mapping: Option<&HashMap<String, String>>) -> Result<RenderedPrompt> {
        match self {
            ChatTemplate::Jinja { source, bos_token, eos_token } => {
                let mut env = Environment::new();
                env.add_function("raise_exception", raise_exception);
                env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
                let template = env.template_from_str(source)?;
                let text = template.render(context! {
                    messages => messages,
                    add_generation_prompt => true,
                    bos_token => bos_token.as_deref().unwrap_or(""),
                    eos_token => eos_token.as_deref().unwrap_or(""),
                })?;
                Ok(RenderedPrompt {
                    text,
                    add_special_tokens: false,
                })
            }
            ChatTemplate::Plain => Ok(RenderedPrompt {
                text: convert_chat(messages, role_mapping),
                add_special_tokens: true,
            }),
        }
    }
}

/// Special tokens appear either as plain strings or as `{"content": ...}` objects
fn special_token(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map.get("content").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn raise_exception(message: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

fn default_role_prefix(key: &str) -> &'static str {
    match key {
        "system" => "ASSISTANT's RULE: ",
        "user" => "USER: ",
        "assistant" => "ASSISTANT: ",
        "stop" => "\n",
        _ => "",
    }
}

/// Plain prompt: `<prefix><content><stop>` per message, then the assistant prefix.
pub fn convert_chat(messages: &[ChatMessage], role_mapping: Option<&HashMap<String, String>>) -> String {
    let lookup = |key: &str| -> String {
        match role_mapping {
            Some(mapping) => mapping.get(key).cloned().unwrap_or_default(),
            None => default_role_prefix(key).to_string(),
        }
    };

    let stop = lookup("stop");
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(&lookup(message.role.as_str()));
        prompt.push_str(&message.content);
        prompt.push_str(&stop);
    }
    prompt.push_str(&lookup("assistant"));
    prompt.trim_end().to_string()
}
