//! Embedding backends for document retrieval

use candle_core::{DType, Tensor};
use tokenizers::Tokenizer;

use crate::error::{EngineError, Result};

/// Interface for embedding models
pub trait Embeddings: Send + Sync {
    /// Embed document chunks
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed_query(text)).collect()
    }

    /// Embed query text
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

/// Which embedder to build for a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingKind {
    /// Mean of the chat model's input-embedding rows
    #[default]
    Model,
    /// Feature hashing of words; needs no weights
    Hashing,
}

impl std::str::FromStr for EmbeddingKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "model" => Ok(EmbeddingKind::Model),
            "hashing" => Ok(EmbeddingKind::Hashing),
            other => Err(format!("unknown embedding kind '{other}', expected 'model' or 'hashing'")),
        }
    }
}

/// Embeds text as the normalised mean of the model's token embeddings
pub struct TokenEmbeddings {
    table: Tensor,
    tokenizer: Tokenizer,
    dimension: usize,
}

impl TokenEmbeddings {
    pub fn new(table: Tensor, tokenizer: Tokenizer) -> Result<Self> {
        let (_, dimension) = table.dims2()?;
        Ok(Self {
            table,
            tokenizer,
            dimension,
        })
    }
}

impl Embeddings for TokenEmbeddings {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let ids = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EngineError::Embedding(e.to_string()))?
            .get_ids()
            .to_vec();
        if ids.is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let ids = Tensor::new(ids.as_slice(), self.table.device())?;
        let rows = self.table.index_select(&ids, 0)?.to_dtype(DType::F32)?;
        let mut vec: Vec<f32> = rows.mean(0)?.to_vec1()?;
        normalize(&mut vec);
        Ok(vec)
    }
}

/// Deterministic bag-of-words embedder using feature hashing
#[derive(Debug, Clone)]
pub struct HashingEmbeddings {
    dimension: usize,
}

impl Default for HashingEmbeddings {
    fn default() -> Self {
        Self { dimension: 384 }
    }
}

impl HashingEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Embeddings for HashingEmbeddings {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = fnv1a_64(word.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        normalize(&mut vec);
        Ok(vec)
    }
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vec {
        *value /= norm;
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
