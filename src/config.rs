//! Generation parameters and session configuration.
//!
//! [`GenerationParams`] is always fully specified. Callers express partial
//! changes as [`ParamOverrides`], where an absent field means "use the
//! session default". [`SessionConfig`] holds the defaults plus the knobs that
//! are fixed for the life of a session, and can be read from a JSON file.

use std::path::Path;

use llama_sampling::SamplingParams;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Effective parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Softmax temperature. 0.0 selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus mass kept by the top-p filter.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Candidates kept by the top-k filter.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Penalty applied to recently seen tokens. 1.0 disables it.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Context window in tokens.
    #[serde(default = "default_context_size")]
    pub context_size: usize,
}

fn default_max_tokens() -> usize {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> usize {
    40
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_thread_count() -> usize {
    4
}

fn default_context_size() -> usize {
    2048
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
            thread_count: default_thread_count(),
            context_size: default_context_size(),
        }
    }
}

impl GenerationParams {
    /// Fill every absent or sentinel override from `self`.
    pub fn resolve(&self, overrides: &ParamOverrides) -> GenerationParams {
        let overrides = overrides.sanitized();
        GenerationParams {
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            repeat_penalty: overrides.repeat_penalty.unwrap_or(self.repeat_penalty),
            thread_count: overrides.thread_count.unwrap_or(self.thread_count),
            context_size: overrides.context_size.unwrap_or(self.context_size),
        }
    }

    /// Sampler settings for these parameters.
    pub fn sampling(&self, repeat_last_n: usize) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n,
        }
    }
}

/// Per-call or per-session parameter changes. `None` keeps the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamOverrides {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub repeat_penalty: Option<f32>,
    pub thread_count: Option<usize>,
    pub context_size: Option<usize>,
}

impl ParamOverrides {
    /// Map a host's sentinel encoding to overrides.
    ///
    /// Non-positive values (negative for temperature) mean "use the default",
    /// never "disable".
    pub fn from_raw(max_tokens: i32, temperature: f32, top_p: f32, top_k: i32, repeat_penalty: f32) -> Self {
        Self {
            max_tokens: usize::try_from(max_tokens).ok(),
            temperature: Some(temperature),
            top_p: Some(top_p),
            top_k: usize::try_from(top_k).ok(),
            repeat_penalty: Some(repeat_penalty),
            thread_count: None,
            context_size: None,
        }
        .sanitized()
    }

    /// Drop every sentinel value: zero counts, a negative or non-finite
    /// temperature, and a non-positive or non-finite `top_p` or penalty.
    pub fn sanitized(&self) -> Self {
        let positive = |v: &f32| v.is_finite() && *v > 0.0;
        Self {
            max_tokens: self.max_tokens.filter(|&n| n > 0),
            temperature: self.temperature.filter(|t| t.is_finite() && *t >= 0.0),
            top_p: self.top_p.filter(positive),
            top_k: self.top_k.filter(|&k| k > 0),
            repeat_penalty: self.repeat_penalty.filter(positive),
            thread_count: self.thread_count.filter(|&n| n > 0),
            context_size: self.context_size.filter(|&n| n > 0),
        }
    }

    pub fn greedy() -> Self {
        Self {
            temperature: Some(0.0),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Session-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Defaults used when a call leaves a parameter unset.
    #[serde(default)]
    pub defaults: GenerationParams,

    /// Sampler seed. When unset the sampler is seeded from the clock at load.
    #[serde(default)]
    pub seed: Option<u64>,

    /// How far back the repeat penalty looks.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    #[serde(default = "default_true")]
    pub use_mmap: bool,

    #[serde(default)]
    pub use_mlock: bool,
}

fn default_repeat_last_n() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            defaults: GenerationParams::default(),
            seed: None,
            repeat_last_n: default_repeat_last_n(),
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
