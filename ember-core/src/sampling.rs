//! Sampling policy - turns a logits vector into the next token id

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;

/// Token sampler implementing greedy, nucleus (top-p) and plain temperature sampling
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Seeded samplers are reproducible; unseeded ones draw from system entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Sample from model logits. Reduced-precision logits are upcast to f32 first and
    /// only the last position is used when a sequence of positions is passed.
    pub fn sample(&mut self, logits: &Tensor, temperature: f64, top_p: f64) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        let vocab = logits.dims().last().copied().unwrap_or(0);
        let values: Vec<f32> = logits.flatten_all()?.to_vec1()?;
        let last = &values[values.len() - vocab..];
        Ok(self.choose_next(last, temperature, top_p))
    }

    /// Choose the next token id from raw logits
    pub fn choose_next(&mut self, logits: &[f32], temperature: f64, top_p: f64) -> u32 {
        if temperature == 0.0 {
            return argmax(logits);
        }
        if top_p > 0.0 && top_p < 1.0 {
            self.sample_top_p(logits, temperature, top_p)
        } else {
            self.sample_categorical(logits, temperature)
        }
    }

    fn sample_top_p(&mut self, logits: &[f32], temperature: f64, top_p: f64) -> u32 {
        let probs = softmax(logits, temperature);
        let mut indexed: Vec<(usize, f64)> = probs.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Keep every token whose higher-ranked mass is still below top_p. The head
        // token is always kept, so the nucleus is never empty.
        let mut mass_before = 0.0;
        let mut nucleus = Vec::new();
        for (idx, p) in indexed {
            if mass_before >= top_p || p <= 0.0 {
                break;
            }
            nucleus.push((idx, p));
            mass_before += p;
        }

        // Masked-out tokens are not in the nucleus at all, so they cannot be drawn.
        let total: f64 = nucleus.iter().map(|(_, p)| p).sum();
        self.draw(&nucleus, total).unwrap_or_else(|| argmax(logits))
    }

    fn sample_categorical(&mut self, logits: &[f32], temperature: f64) -> u32 {
        let weights: Vec<(usize, f64)> = softmax(logits, temperature)
            .into_iter()
            .enumerate()
            .filter(|(_, p)| *p > 0.0)
            .collect();
        let total: f64 = weights.iter().map(|(_, p)| p).sum();
        self.draw(&weights, total).unwrap_or_else(|| argmax(logits))
    }

    /// Inverse-CDF draw over unnormalised weights
    fn draw(&mut self, weights: &[(usize, f64)], total: f64) -> Option<u32> {
        if weights.is_empty() || !total.is_finite() || total <= 0.0 {
            return None;
        }
        let r = self.rng.gen::<f64>() * total;
        let mut cumsum = 0.0;
        for (idx, p) in weights {
            cumsum += p;
            if cumsum > r {
                return Some(*idx as u32);
            }
        }
        weights.last().map(|(idx, _)| *idx as u32)
    }
}

/// Index of the largest logit; ties go to the lowest index
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = i;
        }
    }
    best_idx as u32
}

/// softmax(logits / temperature) in f64. Non-finite logits get zero probability.
pub fn softmax(logits: &[f32], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|&l| l as f64 / temperature).collect();
    let max = scaled
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f64> = scaled
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn counts(sampler: &mut Sampler, logits: &[f32], temperature: f64, top_p: f64, n: usize) -> Vec<usize> {
        let mut counts = vec![0; logits.len()];
        for _ in 0..n {
            counts[sampler.choose_next(logits, temperature, top_p) as usize] += 1;
        }
        counts
    }

    #[test]
    fn test_greedy_is_argmax() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sampler = Sampler::new(None);
        for _ in 0..200 {
            let logits: Vec<f32> = (0..32).map(|_| rng.gen_range(-10.0..10.0)).collect();
            let expected = argmax(&logits);
            for top_p in [0.0, 0.5, 1.0] {
                assert_eq!(sampler.choose_next(&logits, 0.0, top_p), expected);
            }
        }
    }

    #[test]
    fn test_argmax_ties_pick_first() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0, 2.0]), 1);
        assert_eq!(argmax(&[3.0, 3.0]), 0);
        assert_eq!(argmax(&[f32::NEG_INFINITY, -1.0]), 1);
    }

    #[test]
    fn test_top_p_excludes_tail() {
        // probs ~ [0.665, 0.245, 0.090]; top_p 0.8 keeps the first two
        let logits = [2.0f32, 1.0, 0.0];
        let mut sampler = Sampler::new(Some(42));
        let counts = counts(&mut sampler, &logits, 1.0, 0.8, 2000);

        assert_eq!(counts[2], 0);
        assert!(counts[0] > 0);
        assert!(counts[1] > 0);
    }

    #[test]
    fn test_top_p_dominant_token() {
        let logits = [0.0f32, 10.0, 0.0, 0.0];
        let mut sampler = Sampler::new(Some(1));
        let counts = counts(&mut sampler, &logits, 1.0, 0.5, 500);
        assert_eq!(counts[1], 500);
    }

    #[test]
    fn test_top_p_maps_back_to_original_ids() {
        // Highest probability sits at the end of the vocabulary
        let logits = [-5.0f32, -5.0, -5.0, 8.0];
        let mut sampler = Sampler::new(Some(3));
        for _ in 0..100 {
            assert_eq!(sampler.choose_next(&logits, 0.7, 0.9), 3);
        }
    }

    #[test]
    fn test_categorical_never_draws_masked_logits() {
        let logits = [f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY, 0.0];
        let mut sampler = Sampler::new(Some(9));
        let counts = counts(&mut sampler, &logits, 1.0, 1.0, 1000);

        assert_eq!(counts[0], 0);
        assert_eq!(counts[2], 0);
        assert!(counts[1] > 350 && counts[3] > 350);
    }

    #[test]
    fn test_temperature_sharpens_distribution() {
        let logits = [1.0f32, 2.0];
        let mut sampler = Sampler::new(Some(11));
        let hot = counts(&mut sampler, &logits, 5.0, 1.0, 2000);
        let cold = counts(&mut sampler, &logits, 0.1, 1.0, 2000);
        assert!(cold[1] > hot[1]);
        assert!(cold[1] > 1990);
    }

    #[test]
    fn test_seeded_samplers_agree() {
        let logits: Vec<f32> = (0..16).map(|i| (i % 5) as f32).collect();
        let mut a = Sampler::new(Some(5));
        let mut b = Sampler::new(Some(5));
        for _ in 0..50 {
            assert_eq!(a.choose_next(&logits, 1.0, 0.9), b.choose_next(&logits, 1.0, 0.9));
        }
    }

    #[test]
    fn test_sample_upcasts_reduced_precision() {
        let logits = Tensor::new(&[1.0f32, 3.0, 2.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let mut sampler = Sampler::new(None);
        assert_eq!(sampler.sample(&logits, 0.0, 1.0).unwrap(), 1);
    }

    #[test]
    fn test_sample_uses_last_position() {
        let logits = Tensor::new(&[[9.0f32, 0.0, 0.0], [0.0, 0.0, 9.0]], &Device::Cpu).unwrap();
        let mut sampler = Sampler::new(None);
        assert_eq!(sampler.sample(&logits, 0.0, 1.0).unwrap(), 2);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, f32::NEG_INFINITY], 0.5);
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(probs[3], 0.0);
    }
}
