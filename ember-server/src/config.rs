//! Server configuration from command-line flags, with environment fallbacks.

use std::net::SocketAddr;
use std::time::Duration;

use candle_core::DType;
use clap::Parser;
use ember_core::{EngineConfig, EmbeddingKind, RetrievalConfig, ServiceConfig};

/// Local chat inference server
#[derive(Debug, Clone, Parser)]
#[command(name = "ember-server", version, about)]
pub struct Config {
    /// Model to load at startup (local directory or HuggingFace repo id)
    #[arg(long, env = "EMBER_MODEL")]
    pub model: Option<String>,

    /// Address to bind
    #[arg(long, env = "EMBER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "EMBER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// `tracing` filter, e.g. "info" or "debug,tower_http=warn"
    #[arg(long, env = "EMBER_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as newline-delimited JSON
    #[arg(long, env = "EMBER_LOG_JSON")]
    pub log_json: bool,

    /// Weight dtype: f32, f16 or bf16
    #[arg(long, env = "EMBER_DTYPE", default_value = "f32", value_parser = parse_dtype)]
    pub dtype: DType,

    /// Embeddings used for indexing: model or hashing
    #[arg(long, env = "EMBER_EMBEDDINGS", default_value = "model")]
    pub embeddings: EmbeddingKind,

    /// Passages retrieved per query
    #[arg(long, env = "EMBER_RETRIEVAL_K", default_value_t = 4)]
    pub retrieval_k: usize,

    #[arg(long, env = "EMBER_CHUNK_SIZE", default_value_t = 1000)]
    pub chunk_size: usize,

    #[arg(long, env = "EMBER_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,

    /// Abort a generation after this many seconds
    #[arg(long, env = "EMBER_GENERATION_TIMEOUT_SECS")]
    pub generation_timeout_secs: Option<u64>,
}

impl Config {
    pub fn bind_address(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            engine: EngineConfig {
                generation_timeout: self.generation_timeout_secs.map(Duration::from_secs),
            },
            retrieval: RetrievalConfig {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
                k: self.retrieval_k,
                embeddings: self.embeddings,
                ..Default::default()
            },
            dtype: self.dtype,
            ..Default::default()
        }
    }
}

fn parse_dtype(value: &str) -> Result<DType, String> {
    match value.to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(format!("unsupported dtype '{other}', expected f32, f16 or bf16")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["ember-server"]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address().unwrap().to_string(), "127.0.0.1:8080");

        let service = config.service_config();
        assert_eq!(service.retrieval.k, 4);
        assert_eq!(service.retrieval.chunk_size, 1000);
        assert_eq!(service.retrieval.chunk_overlap, 200);
        assert!(service.engine.generation_timeout.is_none());
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "ember-server",
            "--model",
            "/models/llama",
            "--port",
            "9000",
            "--dtype",
            "bf16",
            "--embeddings",
            "hashing",
            "--generation-timeout-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(config.model.as_deref(), Some("/models/llama"));
        assert_eq!(config.dtype, DType::BF16);
        assert_eq!(config.embeddings, EmbeddingKind::Hashing);
        assert_eq!(config.service_config().engine.generation_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_rejects_unknown_dtype() {
        assert!(Config::try_parse_from(["ember-server", "--dtype", "int4"]).is_err());
    }
}
