//! Directory retrieval: load, split, embed, index and query

pub mod embeddings;
pub mod index;
pub mod loader;
pub mod splitter;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use embeddings::{EmbeddingKind, Embeddings, HashingEmbeddings, TokenEmbeddings};
pub use index::VectorIndex;
pub use loader::directory_loader;
pub use splitter::RecursiveTextSplitter;

use crate::error::{EngineError, Result};

/// A piece of text with free-form metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Passage returned by a query, best first
pub type RetrievedPassage = Document;

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.insert("source".to_string(), serde_json::Value::String(source.into()));
        self
    }

    pub(crate) fn from_file(content: String, path: &Path) -> Self {
        Self::new(content).with_source(path.display().to_string())
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Passages returned per query
    pub k: usize,
    /// Candidates considered by MMR
    pub fetch_k: usize,
    /// MMR relevance/diversity trade-off
    pub lambda: f32,
    pub embeddings: EmbeddingKind,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            k: 4,
            fetch_k: 20,
            lambda: 0.5,
            embeddings: EmbeddingKind::default(),
        }
    }
}

/// Outcome of indexing a directory
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub directory: String,
    pub documents: usize,
    pub chunks: usize,
}

/// Owns the single active index
pub struct RetrievalOrchestrator {
    config: RetrievalConfig,
    index: Option<VectorIndex>,
}

impl RetrievalOrchestrator {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config, index: None }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Load, split and embed `directory`, replacing any previous index.
    /// On failure the previous index is left in place.
    pub fn index(&mut self, directory: &Path, embedder: Arc<dyn Embeddings>) -> Result<IndexSummary> {
        let documents = directory_loader(directory)?;
        let splitter = RecursiveTextSplitter::new(self.config.chunk_size, self.config.chunk_overlap);
        let chunks = splitter.split_documents(&documents);

        let summary = IndexSummary {
            directory: directory.display().to_string(),
            documents: documents.len(),
            chunks: chunks.len(),
        };
        self.index = Some(VectorIndex::build(chunks, embedder, directory)?);

        info!(
            "Indexed {}: {} documents, {} chunks",
            summary.directory, summary.documents, summary.chunks
        );
        Ok(summary)
    }

    /// Up to `k` passages for `text`, chosen by maximal marginal relevance
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        let index = self.index.as_ref().ok_or(EngineError::IndexNotReady)?;
        index.max_marginal_relevance_search(text, k, self.config.fetch_k, self.config.lambda)
    }

    pub fn is_ready(&self) -> bool {
        self.index.is_some()
    }

    pub fn indexed_directory(&self) -> Option<&Path> {
        self.index.as_ref().map(|index| index.directory())
    }

    pub fn clear(&mut self) {
        self.index = None;
    }
}

impl Default for RetrievalOrchestrator {
    fn default() -> Self {
        Self::new(RetrievalConfig::default())
    }
}
