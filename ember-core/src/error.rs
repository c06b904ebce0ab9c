use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine and the service operations built on it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No model loaded. Call init with a model path first")]
    ModelNotLoaded,

    #[error("No directory has been indexed yet")]
    IndexNotReady,

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Failed to load model: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Chat template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Compute error: {0}")]
    Compute(#[from] candle_core::Error),

    #[error("Cannot generate from an empty prompt")]
    EmptyPrompt,

    #[error("Generation exceeded the {0:?} deadline")]
    GenerationTimeout(std::time::Duration),

    #[error("Embedding error: {0}")]
    Embedding(String),
}

impl EngineError {
    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        EngineError::Tokenizer(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::MalformedRequest(err.to_string())
    }
}
