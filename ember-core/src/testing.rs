//! Scripted model and word-level tokenizer for tests without real weights

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use std::sync::Arc;
use tokenizers::Tokenizer;

use crate::chat_template::ChatTemplate;
use crate::error::{EngineError, Result};
use crate::model::{CausalLM, ForwardSession, LoadedModel};

pub const UNK_TOKEN: &str = "[UNK]";
pub const EOS_TOKEN: &str = "</s>";

/// Model whose every forward pass puts a peak logit on the next scripted token.
/// The script cycles when exhausted.
pub struct ScriptedModel {
    vocab_size: usize,
    script: Vec<u32>,
    fail_at_step: Option<usize>,
    calls: Arc<Mutex<Vec<(Vec<u32>, usize)>>>,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, script: Vec<u32>) -> Self {
        Self {
            vocab_size,
            script,
            fail_at_step: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the forward pass error on the given (zero-based) step of every session
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Inputs and cache positions seen by forward, across all sessions
    pub fn calls(&self) -> Arc<Mutex<Vec<(Vec<u32>, usize)>>> {
        Arc::clone(&self.calls)
    }
}

impl CausalLM for ScriptedModel {
    fn model_type(&self) -> &str {
        "scripted"
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn start_session(&self) -> Result<Box<dyn ForwardSession + '_>> {
        Ok(Box::new(ScriptedSession { model: self, step: 0 }))
    }
}

struct ScriptedSession<'a> {
    model: &'a ScriptedModel,
    step: usize,
}

impl ForwardSession for ScriptedSession<'_> {
    fn forward(&mut self, input: &[u32], index_pos: usize) -> Result<Tensor> {
        if self.model.fail_at_step == Some(self.step) {
            return Err(EngineError::Compute(candle_core::Error::Msg("out of memory".into())));
        }
        self.model.calls.lock().push((input.to_vec(), index_pos));

        let mut logits = vec![0.0f32; self.model.vocab_size];
        if !self.model.script.is_empty() {
            let next = self.model.script[self.step % self.model.script.len()] as usize;
            logits[next] = 10.0;
        }
        self.step += 1;
        Ok(Tensor::from_vec(logits, self.model.vocab_size, &Device::Cpu)?)
    }
}

/// Word-level tokenizer splitting on whitespace. Ids: `[UNK]` = 0, `</s>` = 1, then `words`.
pub fn word_tokenizer(words: &[&str]) -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert(UNK_TOKEN.to_string(), 0.into());
    vocab.insert(EOS_TOKEN.to_string(), 1.into());
    for word in words {
        let next_id = vocab.len();
        vocab.entry(word.to_string()).or_insert_with(|| next_id.into());
    }

    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": UNK_TOKEN,
        },
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).expect("valid word-level tokenizer")
}

/// A loaded model over `vocab` that emits `script` (words) in order, eos = `</s>`
pub fn scripted_model(vocab: &[&str], script: &[&str]) -> LoadedModel {
    let tokenizer = word_tokenizer(vocab);
    let script = script
        .iter()
        .map(|word| tokenizer.token_to_id(word).expect("script word in vocab"))
        .collect();
    let model = ScriptedModel::new(tokenizer.get_vocab_size(true), script);
    loaded_model(model, tokenizer)
}

/// Wrap an existing scripted model and tokenizer
pub fn loaded_model(model: ScriptedModel, tokenizer: Tokenizer) -> LoadedModel {
    let eos_token_ids = tokenizer.token_to_id(EOS_TOKEN).into_iter().collect();
    LoadedModel {
        model_id: "scripted-model".to_string(),
        model: Box::new(model),
        tokenizer,
        eos_token_ids,
        chat_template: ChatTemplate::Plain,
    }
}
