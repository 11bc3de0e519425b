#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod tests;

use crate::error::{Error, Result};
use crate::layers::softmax_in_place;

/// Number of candidates sampled from by default.
pub const DEFAULT_TOP_K: usize = 5;

/// Temperature applied to candidate logits by default.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A vocabulary id and its logit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: usize,
    pub logit: f32,
}

/// Top-k sampler with temperature scaling.
///
/// Candidates are the `top_k` highest logits; their temperature-scaled softmax is sampled by
/// inverse CDF against one uniform draw from a seeded xorshift generator, so runs with the same
/// seed are reproducible.
#[derive(Debug, Clone)]
pub struct TopKSampler {
    top_k: usize,
    temperature: f32,
    rng_state: u64,
}

impl TopKSampler {
    /// # Arguments
    /// * `top_k` - Number of candidates (at least 1)
    /// * `temperature` - Logit divisor; `0.0` always picks the best candidate
    /// * `seed` - RNG seed
    pub fn new(top_k: usize, temperature: f32, seed: u64) -> Result<Self> {
        if top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".to_string()));
        }
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(Error::Config(format!("temperature must be a non-negative number, got {temperature}")));
        }

        // xorshift never leaves the all-zero state
        Ok(Self { top_k, temperature, rng_state: seed.max(1) })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// The `top_k` highest logits, best first. Equal logits keep their vocabulary order.
    pub fn candidates(&self, logits: &[f32]) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> =
            logits.iter().enumerate().map(|(id, &logit)| Candidate { id, logit }).collect();
        candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
        candidates.truncate(self.top_k);
        candidates
    }

    /// Picks one of `candidates` (best first) with a fresh uniform draw.
    pub fn sample(&mut self, candidates: &[Candidate]) -> Option<usize> {
        let coin = self.random_f32();
        self.sample_with(candidates, coin)
    }

    /// Picks the first candidate whose cumulative probability reaches `coin`.
    ///
    /// Falls back to the best candidate when rounding leaves every cumulant below `coin`.
    pub fn sample_with(&self, candidates: &[Candidate], coin: f32) -> Option<usize> {
        let best = candidates.first()?;
        if self.temperature == 0.0 {
            return Some(best.id);
        }

        let mut probs: Vec<f32> = candidates.iter().map(|c| c.logit / self.temperature).collect();
        softmax_in_place(&mut probs);

        let mut cdf = 0.0;
        for (candidate, prob) in candidates.iter().zip(probs) {
            cdf += prob;
            if coin <= cdf {
                return Some(candidate.id);
            }
        }
        Some(best.id)
    }
}
