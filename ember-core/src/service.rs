//! Service context - the active model, the active index and the request operations
//!
//! `init` and `index` replace shared state and hold the write lock while they run.
//! Queries hold the read lock for the whole generation, so they may run side by
//! side but never observe a half-replaced model or index.

use candle_core::{DType, Device};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{EngineConfig, EngineStats, InferenceEngine};
use crate::error::{EngineError, Result};
use crate::model::{LoadedModel, ModelConfig};
use crate::prompt::compose;
use crate::request::{ChatMessage, GenerationRequest};
use crate::response::GenerationResponse;
use crate::retrieval::{IndexSummary, RetrievalConfig, RetrievalOrchestrator, RetrievedPassage};

/// Temperature used by `/v1/chat/completions` when the request sets none
pub const CHAT_DEFAULT_TEMPERATURE: f64 = 1.0;
/// Temperature used by `/api/query` when the request sets none
pub const QUERY_DEFAULT_TEMPERATURE: f64 = 0.0;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    pub retrieval: RetrievalConfig,
    /// Weight dtype for models loaded through `init`
    pub dtype: DType,
    pub device: Device,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retrieval: RetrievalConfig::default(),
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Unloaded,
    ModelLoaded,
    Indexed,
}

/// Process-wide model and index
pub struct ModelState {
    engine: Option<Arc<InferenceEngine>>,
    retrieval: RetrievalOrchestrator,
}

impl ModelState {
    fn state(&self) -> ServiceState {
        match (&self.engine, self.retrieval.is_ready()) {
            (None, _) => ServiceState::Unloaded,
            (Some(_), false) => ServiceState::ModelLoaded,
            (Some(_), true) => ServiceState::Indexed,
        }
    }

    fn engine(&self) -> Result<&Arc<InferenceEngine>> {
        self.engine.as_ref().ok_or(EngineError::ModelNotLoaded)
    }
}

/// Prompt ready for decoding
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub messages: Vec<ChatMessage>,
    pub text: String,
    pub tokens: Vec<u32>,
    pub passages: Option<Vec<RetrievedPassage>>,
}

pub struct ServiceContext {
    config: ServiceConfig,
    state: RwLock<ModelState>,
}

impl ServiceContext {
    pub fn new(config: ServiceConfig) -> Self {
        let retrieval = RetrievalOrchestrator::new(config.retrieval.clone());
        Self {
            config,
            state: RwLock::new(ModelState { engine: None, retrieval }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        self.state.read().state()
    }

    /// Id of the model answering requests
    pub fn active_model(&self) -> Option<String> {
        self.state.read().engine.as_ref().map(|e| e.model_id().to_string())
    }

    pub fn stats(&self) -> Option<EngineStats> {
        self.state.read().engine.as_ref().map(|e| e.stats())
    }

    /// Load `model` and make it the active model, dropping any index.
    /// A failed load leaves the previous model and index in place.
    pub fn init(&self, model: &str) -> Result<String> {
        let mut state = self.state.write();
        let model_config = ModelConfig::new(model).with_dtype(self.config.dtype);
        let engine = InferenceEngine::load(&model_config, &self.config.device, self.config.engine.clone())?;
        Ok(Self::activate(&mut state, engine))
    }

    /// Make an already loaded model the active one
    pub fn install(&self, model: LoadedModel) -> String {
        let engine = InferenceEngine::new(model, self.config.engine.clone());
        Self::activate(&mut self.state.write(), engine)
    }

    fn activate(state: &mut ModelState, engine: InferenceEngine) -> String {
        let model_id = engine.model_id().to_string();
        if let Some(previous) = state.engine.replace(Arc::new(engine)) {
            info!("Replacing model {} with {}", previous.model_id(), model_id);
        }
        if state.retrieval.is_ready() {
            info!("Discarding index of {:?}", state.retrieval.indexed_directory());
        }
        state.retrieval.clear();
        info!("Active model: {}", model_id);
        model_id
    }

    /// Index `directory` for retrieval, replacing any previous index
    pub fn index(&self, directory: &str) -> Result<IndexSummary> {
        let mut state = self.state.write();
        let engine = Arc::clone(state.engine()?);
        let embedder = engine.embedder(self.config.retrieval.embeddings)?;
        state.retrieval.index(Path::new(directory), embedder)
    }

    /// Compose, render and tokenize the prompt for `request`
    pub fn prepare(&self, request: &GenerationRequest) -> Result<PreparedPrompt> {
        let state = self.state.read();
        Self::prepare_with(&state, request)
    }

    fn prepare_with(state: &ModelState, request: &GenerationRequest) -> Result<PreparedPrompt> {
        let engine = state.engine()?;

        let passages = match request.directory.as_deref() {
            Some(directory) => {
                let indexed = state.retrieval.indexed_directory().ok_or(EngineError::IndexNotReady)?;
                if indexed != Path::new(directory) {
                    warn!(
                        "Request names {} but the active index is {}",
                        directory,
                        indexed.display()
                    );
                }
                let question = request.messages.last().map(|m| m.content.as_str()).unwrap_or_default();
                Some(state.retrieval.query(question, state.retrieval.config().k)?)
            }
            None => None,
        };

        let messages = compose(&request.messages, passages.as_deref(), request.instructions.as_ref());
        let prompt = engine.render_prompt(&messages, request.role_mapping.as_ref())?;
        Ok(PreparedPrompt {
            messages,
            text: prompt.text,
            tokens: prompt.tokens,
            passages,
        })
    }

    /// Answer a chat request with the active model
    pub fn query(&self, request: &GenerationRequest, default_temperature: f64) -> Result<GenerationResponse> {
        request.validate()?;
        let state = self.state.read();
        let engine = state.engine()?;

        let prompt = Self::prepare_with(&state, request)?;
        let stop = engine.stop_matcher(&request.stop.to_vec())?;
        let params = request.sampling_params(default_temperature);
        let result = engine.generate_from_tokens(&prompt.tokens, &params, &stop)?;

        info!(
            "Generated {} tokens from a {}-token prompt ({:.1} tok/s, {:?})",
            result.generated_tokens, result.prompt_tokens, result.tokens_per_second, result.finish_reason
        );
        Ok(GenerationResponse::new(
            engine.model_id(),
            result.text,
            result.prompt_tokens,
            result.generated_tokens,
        ))
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}
