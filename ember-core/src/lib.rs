//! Ember Core - local chat inference with directory retrieval
//!
//! This crate implements the core inference logic including:
//! - LLaMA-family model loading via candle-transformers, from disk or the HuggingFace Hub
//! - A bounded decode loop with temperature, top-p and repetition-penalty sampling
//! - Stop-sequence matching and chat-template rendering
//! - Directory indexing and maximal-marginal-relevance retrieval
//! - The service context shared by the HTTP front end

pub mod chat_template;
pub mod decode;
pub mod engine;
pub mod error;
pub mod model;
pub mod prompt;
pub mod request;
pub mod response;
pub mod retrieval;
pub mod sampling;
pub mod service;
pub mod stop;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use chat_template::ChatTemplate;
pub use decode::DecodeLoop;
pub use engine::{EngineConfig, EngineStats, FinishReason, GenerationResult, InferenceEngine};
pub use error::{EngineError, Result};
pub use model::{load_model, CausalLM, ForwardSession, LoadedModel, ModelConfig};
pub use prompt::compose;
pub use request::{ChatMessage, GenerationRequest, IndexRequest, InitRequest, Instructions, Role, SamplingParams, StopWords};
pub use response::GenerationResponse;
pub use retrieval::{Document, EmbeddingKind, IndexSummary, RetrievalConfig, RetrievalOrchestrator, RetrievedPassage};
pub use sampling::Sampler;
pub use service::{ServiceConfig, ServiceContext, ServiceState, CHAT_DEFAULT_TEMPERATURE, QUERY_DEFAULT_TEMPERATURE};
pub use stop::{stopping_criteria, StopCondition, StopMatcher};
