//! # llama-sampling
//!
//! Turns per-vocabulary scores into the next token.
//!
//! The pipeline runs in a fixed order, because reordering the stages changes
//! the resulting distribution:
//!
//! ```text
//! logits ─► repeat penalty ─► top-k ─► top-p ─► temperature ─► draw
//! ```
//!
//! - Repeat penalty: pushes down tokens seen in the recent history
//!   (1.0 is the identity)
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Temperature scaling (0.0 = greedy)
//! - Deterministic seeded RNG for reproducible draws

use std::collections::HashSet;

use llama_engine::TokenId;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be >= 0")]
    InvalidTemperature,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// One entry of the candidate array: token id, its current score, and its
/// probability once [`Candidates::softmax`] has run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// The working set the pipeline stages narrow down.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<Candidate>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary id, in id order. NaN scores are treated
    /// as impossible (negative infinity).
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit: if logit.is_nan() { f32::NEG_INFINITY } else { logit },
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[Candidate] {
        &self.data
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.data.iter().map(|c| c.id).collect()
    }

    /// Sort by descending score. Stable, so equal scores keep id order.
    fn sort_desc(&mut self) {
        if !self.sorted {
            self.data.sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
    }

    /// Sort descending and fill `p` with the softmax of the current scores.
    pub fn softmax(&mut self) {
        self.sort_desc();
        let Some(max_logit) = self.data.first().map(|c| c.logit) else {
            return;
        };

        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = (c.logit - max_logit).exp();
            if c.p.is_nan() {
                c.p = 0.0;
            }
            sum += c.p;
        }

        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        } else {
            let uniform = 1.0 / self.data.len() as f32;
            for c in &mut self.data {
                c.p = uniform;
            }
        }
    }

    /// Penalize every candidate whose id occurs in `history`.
    ///
    /// Positive scores are divided by `penalty`, non-positive scores
    /// multiplied, so a repeated token always becomes less likely.
    pub fn apply_repeat_penalty(&mut self, history: &[TokenId], penalty: f32) {
        if history.is_empty() || (penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        let seen: HashSet<TokenId> = history.iter().copied().collect();
        for c in &mut self.data {
            if seen.contains(&c.id) {
                if c.logit <= 0.0 {
                    c.logit *= penalty;
                } else {
                    c.logit /= penalty;
                }
            }
        }
        self.sorted = false;
    }

    /// Keep the `k` highest-scoring candidates (never fewer than `min_keep`).
    /// `k == 0` keeps everything.
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        if self.data.is_empty() {
            return;
        }
        let k = if k == 0 { self.data.len() } else { k };
        let k = k.max(min_keep).min(self.data.len());
        self.sort_desc();
        self.data.truncate(k);
    }

    /// Keep the smallest descending-score prefix whose cumulative probability
    /// reaches `p` (never fewer than `min_keep`). `p >= 1.0` keeps everything.
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let mut cumsum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cumsum += c.p;
            if cumsum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Divide every remaining score by `temperature`.
    pub fn temperature(&mut self, temperature: f32) {
        for c in &mut self.data {
            c.logit /= temperature;
        }
    }

    /// The highest-scoring candidate; lowest id on ties.
    pub fn greedy(&mut self) -> SamplingResult<TokenId> {
        self.sort_desc();
        self.data
            .first()
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)
    }

    /// Draw one candidate from the softmax of the remaining scores.
    pub fn draw(&mut self, rng: &mut SeededRng) -> SamplingResult<TokenId> {
        if self.data.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        self.softmax();

        let r = rng.next_f32();
        let mut cumsum = 0.0;
        for c in &self.data {
            cumsum += c.p;
            if r < cumsum {
                return Ok(c.id);
            }
        }

        // Rounding left r above the final cumulative sum
        self.data
            .iter()
            .rev()
            .find(|c| c.p > 0.0)
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)
    }
}

/// Fully-resolved sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// 0.0 = greedy.
    pub temperature: f32,
    /// 0 = disabled.
    pub top_k: usize,
    /// 1.0 = disabled.
    pub top_p: f32,
    /// 1.0 = disabled.
    pub repeat_penalty: f32,
    /// How many trailing history tokens the repeat penalty considers.
    pub repeat_last_n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }
}

/// Sampling configuration plus the RNG it draws with.
///
/// The RNG advances on every stochastic draw, so one sampler reused across
/// requests yields a reproducible stream for a fixed seed.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,

    /// RNG state for reproducible sampling. Mutated on each draw.
    rng: SeededRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        Self {
            params,
            rng: SeededRng::new(42),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.params.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.params.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.params.top_p = p;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32, last_n: usize) -> Self {
        self.params.repeat_penalty = penalty;
        self.params.repeat_last_n = last_n;
        self
    }

    /// Replace the parameters, keeping the RNG stream.
    pub fn set_params(&mut self, params: SamplingParams) {
        self.params = params;
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Choose the next token from `logits`.
    ///
    /// `history` is the sequence so far (prompt then generated tokens); only
    /// its last `repeat_last_n` entries feed the repeat penalty.
    pub fn sample(&mut self, logits: &[f32], history: &[TokenId]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if self.params.temperature < 0.0 || self.params.temperature.is_nan() {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut candidates = Candidates::from_logits(logits);

        let window = history.len().saturating_sub(self.params.repeat_last_n);
        candidates.apply_repeat_penalty(&history[window..], self.params.repeat_penalty);

        candidates.top_k(self.params.top_k, 1);
        candidates.top_p(self.params.top_p, 1);

        if self.params.temperature == 0.0 {
            return candidates.greedy();
        }
        candidates.temperature(self.params.temperature);
        candidates.draw(&mut self.rng)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(SamplingParams::default())
    }
}
