//! Decode loop - a step function over a model session
//!
//! The loop itself never terminates; bounding it by `max_tokens` and stop
//! conditions is the job of the driver in [`crate::engine`].

use candle_core::Tensor;

use crate::error::{EngineError, Result};
use crate::model::{CausalLM, ForwardSession};
use crate::request::SamplingParams;
use crate::sampling::Sampler;

/// Incremental decoder holding one model session and its cache.
///
/// Abandoning a `DecodeLoop` drops the session; decoding again means starting a
/// new loop with a fresh cache.
pub struct DecodeLoop<'m> {
    session: Box<dyn ForwardSession + 'm>,
    sampler: Sampler,
    temperature: f64,
    top_p: f64,
    repetition_penalty: Option<f32>,
    repetition_context_size: usize,
    /// Prompt followed by every emitted token
    context: Vec<u32>,
    /// Number of context tokens already fed to the session
    fed: usize,
}

impl<'m> DecodeLoop<'m> {
    pub fn new(model: &'m dyn CausalLM, prompt: &[u32], params: &SamplingParams) -> Result<Self> {
        if prompt.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        Ok(Self {
            session: model.start_session()?,
            sampler: Sampler::new(params.seed),
            temperature: params.temperature,
            top_p: params.top_p,
            repetition_penalty: params.repetition_penalty,
            repetition_context_size: params.repetition_context_size,
            context: prompt.to_vec(),
            fed: 0,
        })
    }

    /// Produce the next token. The first call prefills the whole prompt; later calls
    /// feed only the token emitted by the previous step.
    pub fn step(&mut self) -> Result<u32> {
        let input = &self.context[self.fed..];
        let logits = self.session.forward(input, self.fed)?;
        self.fed = self.context.len();

        let logits = self.apply_repetition_penalty(logits)?;
        let token = self.sampler.sample(&logits, self.temperature, self.top_p)?;
        self.context.push(token);
        Ok(token)
    }

    /// Down-weight logits of tokens seen in the trailing context window
    fn apply_repetition_penalty(&self, logits: Tensor) -> Result<Tensor> {
        match self.repetition_penalty {
            Some(penalty) if penalty != 1.0 && self.repetition_context_size > 0 => {
                let start_at = self.context.len().saturating_sub(self.repetition_context_size);
                Ok(candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    penalty,
                    &self.context[start_at..],
                )?)
            }
            _ => Ok(logits),
        }
    }

    /// Tokens emitted so far, excluding the prompt
    pub fn generated(&self, prompt_len: usize) -> &[u32] {
        &self.context[prompt_len..]
    }
}

impl Iterator for DecodeLoop<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn greedy() -> SamplingParams {
        SamplingParams {
            temperature: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefill_then_single_token_steps() {
        let model = ScriptedModel::new(8, vec![5, 6, 7]);
        let calls = model.calls();
        let mut decoder = DecodeLoop::new(&model, &[1, 2, 3], &greedy()).unwrap();

        let tokens: Vec<u32> = decoder.by_ref().take(4).map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec![5, 6, 7, 5]);

        let calls = calls.lock();
        assert_eq!(calls[0], (vec![1, 2, 3], 0));
        assert_eq!(calls[1], (vec![5], 3));
        assert_eq!(calls[2], (vec![6], 4));
        assert_eq!(calls[3], (vec![7], 5));
        assert_eq!(decoder.generated(3), &[5, 6, 7, 5]);
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let model = ScriptedModel::new(4, vec![1]);
        assert!(matches!(
            DecodeLoop::new(&model, &[], &greedy()),
            Err(EngineError::EmptyPrompt)
        ));
    }

    #[test]
    fn test_fresh_loop_starts_new_session() {
        let model = ScriptedModel::new(8, vec![4, 5]);
        let mut first = DecodeLoop::new(&model, &[1], &greedy()).unwrap();
        assert_eq!(first.step().unwrap(), 4);
        drop(first);

        let mut second = DecodeLoop::new(&model, &[1], &greedy()).unwrap();
        assert_eq!(second.step().unwrap(), 4);
    }

    #[test]
    fn test_compute_error_propagates() {
        let model = ScriptedModel::new(8, vec![4]).failing_at(1);
        let mut decoder = DecodeLoop::new(&model, &[1], &greedy()).unwrap();
        assert!(decoder.step().is_ok());
        assert!(matches!(decoder.step(), Err(EngineError::Compute(_))));
    }

    #[test]
    fn test_repetition_penalty_down_weights_recent_tokens() {
        let model = ScriptedModel::new(3, vec![0]);
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: Some(2.0),
            repetition_context_size: 4,
            ..Default::default()
        };
        let decoder = DecodeLoop::new(&model, &[1], &params).unwrap();

        let logits = Tensor::new(&[1.0f32, 2.0, 1.5], &candle_core::Device::Cpu).unwrap();
        let penalized: Vec<f32> = decoder.apply_repetition_penalty(logits).unwrap().to_vec1().unwrap();
        assert_eq!(penalized, vec![1.0, 1.0, 1.5]);
    }

    #[test]
    fn test_penalty_window_excludes_old_tokens() {
        let model = ScriptedModel::new(3, vec![0]);
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: Some(2.0),
            repetition_context_size: 1,
            ..Default::default()
        };
        let decoder = DecodeLoop::new(&model, &[1, 2], &params).unwrap();

        let logits = Tensor::new(&[1.0f32, 2.0, 1.5], &candle_core::Device::Cpu).unwrap();
        let penalized: Vec<f32> = decoder.apply_repetition_penalty(logits).unwrap().to_vec1().unwrap();
        assert_eq!(penalized, vec![1.0, 2.0, 0.75]);
    }
}
