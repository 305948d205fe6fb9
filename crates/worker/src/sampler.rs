//! Per-session token sampling
//!
//! Every session owns one [`SamplerState`]; the worker never lets a session
//! draw from another session's RNG.
//!
//! ```text
//! Logits ─► temperature ─► top-k ─► softmax ─► top-p ─► weighted draw
//! ```
//!
//! A temperature of zero short-circuits to argmax.

use crate::model::Logits;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use seqloop_common::config::SamplingConfig;
use seqloop_common::error::{Result, SeqloopError};
use seqloop_proto::TokenId;

/// Private sampler of one session
#[derive(Debug, Clone)]
pub struct SamplerState {
    config: SamplingConfig,
    rng: StdRng,
    draws: u64,
}

impl SamplerState {
    /// Create a sampler, seeded from the config or from entropy
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            draws: 0,
        }
    }

    /// Sampling parameters
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Tokens drawn so far
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Pick the next token from one logit row
    pub fn sample(&mut self, logits: &Logits) -> Result<TokenId> {
        let token = if self.config.temperature <= 0.0 {
            argmax(logits)?
        } else {
            self.sample_distribution(logits)?
        };
        self.draws += 1;
        Ok(token)
    }

    fn sample_distribution(&mut self, logits: &Logits) -> Result<TokenId> {
        let temperature = self.config.temperature;
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, logit)| logit.is_finite())
            .map(|(index, &logit)| (index, logit / temperature))
            .collect();

        if candidates.is_empty() {
            return Err(SeqloopError::sampling("no finite logits to sample from"));
        }

        candidates.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
        if self.config.top_k > 0 {
            candidates.truncate(self.config.top_k);
        }

        // Softmax relative to the best candidate.
        let max = candidates[0].1;
        let mut probs: Vec<f32> = candidates.iter().map(|(_, l)| (l - max).exp()).collect();
        let total: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= total;
        }

        if self.config.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.config.top_p {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
            candidates.truncate(keep);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| SeqloopError::sampling(format!("invalid distribution: {}", e)))?;
        let (index, _) = candidates[dist.sample(&mut self.rng)];
        Ok(index as TokenId)
    }
}

fn argmax(logits: &Logits) -> Result<TokenId> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, logit)| !logit.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .filter(|(_, logit)| logit.is_finite())
        .map(|(index, _)| index as TokenId)
        .ok_or_else(|| SeqloopError::sampling("no finite logits to sample from"))
}
