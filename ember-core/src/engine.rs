//! Inference engine - orchestrates prompt rendering and bounded decoding
//!
//! The engine owns a loaded model and drives [`DecodeLoop`] until `max_tokens`,
//! an eos token or a stop sequence ends generation.

use candle_core::Device;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::decode::DecodeLoop;
use crate::error::{EngineError, Result};
use crate::model::{load_model, LoadedModel, ModelConfig};
use crate::request::{ChatMessage, SamplingParams};
use crate::retrieval::embeddings::{EmbeddingKind, Embeddings, HashingEmbeddings, TokenEmbeddings};
use crate::stop::StopMatcher;

/// Configuration for the inference engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound on wall-clock time spent decoding one request
    pub generation_timeout: Option<Duration>,
}

/// Engine statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub model_id: String,
    pub model_type: String,
    pub vocab_size: usize,
}

/// Result of a single generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Generated tokens, after stop trimming
    pub tokens: Vec<u32>,
    /// Generated text
    pub text: String,
    /// Number of prompt tokens
    pub prompt_tokens: usize,
    /// Number of generated tokens
    pub generated_tokens: usize,
    /// Tokens per second
    pub tokens_per_second: f64,
    /// Finish reason
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FinishReason {
    Length,
    Stop,
}

/// Rendered chat prompt
#[derive(Debug, Clone)]
pub struct PromptTokens {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// Inference engine around one loaded model
pub struct InferenceEngine {
    config: EngineConfig,
    model: LoadedModel,
}

impl InferenceEngine {
    pub fn new(model: LoadedModel, config: EngineConfig) -> Self {
        Self { config, model }
    }

    /// Load a model and wrap it in an engine
    pub fn load(model_config: &ModelConfig, device: &Device, config: EngineConfig) -> Result<Self> {
        info!("Initializing inference engine...");
        let model = load_model(model_config, device).map_err(EngineError::ModelLoad)?;
        Ok(Self::new(model, config))
    }

    pub fn model_id(&self) -> &str {
        &self.model.model_id
    }

    /// Encode a prompt to tokens
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        self.model.encode(text, add_special_tokens)
    }

    /// Decode tokens to text
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.model.decode(tokens)
    }

    /// Render messages through the chat template and tokenize the result
    pub fn render_prompt(&self, messages: &[ChatMessage], role_mapping: Option<&HashMap<String, String>>) -> Result<PromptTokens> {
        let rendered = self.model.chat_template.render(messages, role_mapping)?;
        let tokens = self.encode(&rendered.text, rendered.add_special_tokens)?;
        Ok(PromptTokens {
            text: rendered.text,
            tokens,
        })
    }

    /// Stop matcher for the given stop words and the model's eos ids
    pub fn stop_matcher(&self, stop_words: &[String]) -> Result<StopMatcher> {
        let stop_id_sequences = stop_words
            .iter()
            .map(|word| self.encode(word, false))
            .collect::<Result<Vec<_>>>()?;
        Ok(StopMatcher::new(stop_id_sequences, self.model.eos_token_ids.clone()))
    }

    /// Generate text from a raw prompt, stopping only on eos or `max_tokens`
    pub fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<GenerationResult> {
        let tokens = self.encode(prompt, true)?;
        let stop = self.stop_matcher(&[])?;
        self.generate_from_tokens(&tokens, params, &stop)
    }

    /// Generate text from tokens.
    ///
    /// Any compute error discards everything generated so far.
    pub fn generate_from_tokens(&self, prompt_tokens: &[u32], params: &SamplingParams, stop: &StopMatcher) -> Result<GenerationResult> {
        let start_time = Instant::now();
        let deadline = self.config.generation_timeout.map(|timeout| (start_time + timeout, timeout));

        let mut decoder = DecodeLoop::new(self.model.model.as_ref(), prompt_tokens, params)?;
        let mut generated_tokens = Vec::new();
        let mut finish_reason = FinishReason::Length;

        while generated_tokens.len() < params.max_tokens {
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    warn!("Generation exceeded {:?} after {} tokens", timeout, generated_tokens.len());
                    return Err(EngineError::GenerationTimeout(timeout));
                }
            }

            let token = decoder.step()?;
            generated_tokens.push(token);

            let condition = stop.check(&generated_tokens);
            if condition.stop_met {
                if stop.is_eos(token) {
                    generated_tokens.pop();
                }
                let keep = generated_tokens.len().saturating_sub(condition.trim_length);
                generated_tokens.truncate(keep);
                finish_reason = FinishReason::Stop;
                debug!("Stop condition met, trimmed {} tokens", condition.trim_length);
                break;
            }
        }
        drop(decoder);

        let gen_count = generated_tokens.len();
        let text = self.decode(&generated_tokens)?;
        let elapsed = start_time.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 { gen_count as f64 / elapsed } else { 0.0 };

        Ok(GenerationResult {
            tokens: generated_tokens,
            text,
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: gen_count,
            tokens_per_second,
            finish_reason,
        })
    }

    /// Embedder matching this model. Falls back to hashing when the model exposes
    /// no input-embedding table.
    pub fn embedder(&self, kind: EmbeddingKind) -> Result<Arc<dyn Embeddings>> {
        match (kind, self.model.model.token_embeddings()) {
            (EmbeddingKind::Model, Some(table)) => Ok(Arc::new(TokenEmbeddings::new(
                table.clone(),
                self.model.tokenizer.clone(),
            )?)),
            (EmbeddingKind::Model, None) => {
                warn!("Model exposes no token embeddings, using hashing embeddings");
                Ok(Arc::new(HashingEmbeddings::default()))
            }
            (EmbeddingKind::Hashing, _) => Ok(Arc::new(HashingEmbeddings::default())),
        }
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            model_id: self.model.model_id.clone(),
            model_type: self.model.model_type().to_string(),
            vocab_size: self.model.vocab_size(),
        }
    }
}
