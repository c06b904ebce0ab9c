//! Model loading and management
//!
//! Loads a model from a local directory or the HuggingFace Hub and exposes it to the
//! decode loop through the [`CausalLM`] / [`ForwardSession`] seam.

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

use crate::chat_template::ChatTemplate;
use crate::error::{EngineError, Result};

const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// `model_type` values the Llama implementation can run
pub const SUPPORTED_MODEL_TYPES: &[&str] = &["llama"];

/// A causal language model able to open independent decoding sessions.
///
/// Every session owns its own incremental attention cache, so sessions opened from
/// the same model never observe each other's state.
pub trait CausalLM: Send + Sync {
    /// Architecture name as declared by the model config (e.g. "llama")
    fn model_type(&self) -> &str;

    fn vocab_size(&self) -> usize;

    /// Open a session with an empty cache
    fn start_session(&self) -> Result<Box<dyn ForwardSession + '_>>;

    /// Input embedding table `[vocab, hidden]`, when the model exposes one
    fn token_embeddings(&self) -> Option<&Tensor> {
        None
    }
}

/// One decoding pass over a model with its cache
pub trait ForwardSession {
    /// Feed `input` at cache position `index_pos` and return the 1-D logits for the
    /// position following the last input token.
    fn forward(&mut self, input: &[u32], index_pos: usize) -> Result<Tensor>;
}

/// Configuration for model loading
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Local model directory or HuggingFace model ID
    pub model_id: String,
    /// Model revision/branch, used for Hub downloads only
    pub revision: String,
    /// Data type for model weights
    pub dtype: DType,
    /// Whether to use flash attention
    pub use_flash_attn: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "HuggingFaceTB/SmolLM2-135M-Instruct".to_string(),
            revision: "main".to_string(),
            dtype: DType::F32,
            use_flash_attn: false,
        }
    }
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
}

/// Loaded model ready for inference
pub struct LoadedModel {
    /// What `init` was called with; reported as the response `model`
    pub model_id: String,
    pub model: Box<dyn CausalLM>,
    pub tokenizer: Tokenizer,
    pub eos_token_ids: Vec<u32>,
    pub chat_template: ChatTemplate,
}

impl LoadedModel {
    pub fn model_type(&self) -> &str {
        self.model.model_type()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        self.tokenizer
            .encode(text, add_special_tokens)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(EngineError::tokenizer)
    }

    /// Decode token ids to text, dropping replacement characters left by partial
    /// multi-byte sequences.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(EngineError::tokenizer)?;
        Ok(text.replace(REPLACEMENT_CHAR, ""))
    }
}

/// LLaMA-family model backed by candle-transformers
pub struct LlamaModel {
    model: Llama,
    config: Config,
    model_type: String,
    device: Device,
    dtype: DType,
    embed_tokens: Option<Tensor>,
}

impl CausalLM for LlamaModel {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn start_session(&self) -> Result<Box<dyn ForwardSession + '_>> {
        let cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(Box::new(LlamaSession {
            model: &self.model,
            cache,
            device: &self.device,
        }))
    }

    fn token_embeddings(&self) -> Option<&Tensor> {
        self.embed_tokens.as_ref()
    }
}

struct LlamaSession<'a> {
    model: &'a Llama,
    cache: Cache,
    device: &'a Device,
}

impl ForwardSession for LlamaSession<'_> {
    fn forward(&mut self, input: &[u32], index_pos: usize) -> Result<Tensor> {
        let input = Tensor::new(input, self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, index_pos, &mut self.cache)?;
        Ok(logits.squeeze(0)?)
    }
}

/// Where model files come from
enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    fn resolve(config: &ModelConfig) -> anyhow::Result<Self> {
        let path = Path::new(&config.model_id);
        if path.is_dir() {
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(ModelSource::Hub(api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.revision.clone(),
        ))))
    }

    fn get(&self, file: &str) -> anyhow::Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(file);
                if !path.is_file() {
                    bail!("{} not found in {}", file, dir.display());
                }
                Ok(path)
            }
            ModelSource::Hub(repo) => Ok(repo.get(file)?),
        }
    }

    fn try_get(&self, file: &str) -> Option<PathBuf> {
        self.get(file).ok()
    }
}

/// Load safetensors files, following the shard index when there is one
fn load_safetensors(source: &ModelSource) -> anyhow::Result<Vec<PathBuf>> {
    let Some(json_file) = source.try_get("model.safetensors.index.json") else {
        return Ok(vec![source.get("model.safetensors")?]);
    };

    let json: serde_json::Value = serde_json::from_reader(&std::fs::File::open(&json_file)?)?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => bail!("no weight map in {:?}", json_file),
    };

    let mut shard_names: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shard_names.sort_unstable();
    shard_names.dedup();

    shard_names.into_iter().map(|name| source.get(name)).collect()
}

fn eos_ids_from_config(eos: Option<LlamaEosToks>) -> Vec<u32> {
    match eos {
        Some(LlamaEosToks::Single(id)) => vec![id],
        Some(LlamaEosToks::Multiple(ids)) => ids,
        None => Vec::new(),
    }
}

/// Load a model from a local directory or the HuggingFace Hub
pub fn load_model(config: &ModelConfig, device: &Device) -> anyhow::Result<LoadedModel> {
    info!("Loading model: {}", config.model_id);
    let source = ModelSource::resolve(config)?;

    info!("Loading tokenizer...");
    let tokenizer_file = source.get("tokenizer.json")?;
    let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

    let chat_template = match source.try_get("tokenizer_config.json") {
        Some(path) => ChatTemplate::from_tokenizer_config(&path)?,
        None => ChatTemplate::Plain,
    };

    info!("Loading model config...");
    let config_file = source.get("config.json")?;
    let raw_config = std::fs::read(&config_file)?;
    let model_type = serde_json::from_slice::<serde_json::Value>(&raw_config)?
        .get("model_type")
        .and_then(|v| v.as_str())
        .unwrap_or("llama")
        .to_string();
    if !SUPPORTED_MODEL_TYPES.contains(&model_type.as_str()) {
        bail!(
            "unsupported model_type '{}', expected one of {:?}",
            model_type,
            SUPPORTED_MODEL_TYPES
        );
    }
    let llama_config: LlamaConfig = serde_json::from_slice(&raw_config).context("unsupported model config")?;
    let model_config = llama_config.into_config(config.use_flash_attn);

    let mut eos_token_ids = eos_ids_from_config(model_config.eos_token_id.clone());
    if eos_token_ids.is_empty() {
        let eos_token = chat_template.eos_token().unwrap_or("</s>");
        eos_token_ids.extend(tokenizer.token_to_id(eos_token));
    }

    info!("Loading model weights...");
    let filenames = load_safetensors(&source)?;
    info!("Loading {} safetensor file(s)", filenames.len());

    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, config.dtype, device)? };
    let embed_tokens = vb
        .get((model_config.vocab_size, model_config.hidden_size), "model.embed_tokens.weight")
        .ok();
    let model = Llama::load(vb, &model_config).map_err(|e| anyhow!("Failed to load model: {}", e))?;

    info!("Model loaded successfully!");
    info!("  - Type: {}", model_type);
    info!("  - Vocab size: {}", model_config.vocab_size);
    info!("  - Hidden size: {}", model_config.hidden_size);
    info!("  - Layers: {}", model_config.num_hidden_layers);
    info!("  - Eos ids: {:?}", eos_token_ids);

    let model = LlamaModel {
        model,
        config: model_config,
        model_type,
        device: device.clone(),
        dtype: config.dtype,
        embed_tokens,
    };

    Ok(LoadedModel {
        model_id: config.model_id.clone(),
        model: Box::new(model),
        tokenizer,
        eos_token_ids,
        chat_template,
    })
}
