//! Error types for the llama-bridge crate.

use std::path::PathBuf;

use llama_engine::EngineError;
use thiserror::Error;

pub use llama_tokenizer::TokenizerError;

/// Engine decode failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(transparent)]
pub struct DecodeError(#[from] pub EngineError);

/// Loading failed. The session is always left with nothing loaded.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to load model from {}: {source}", .path.display())]
    Model {
        path: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("Failed to create context: {0}")]
    Context(#[source] EngineError),
}

/// Generation could not start, or its prefill failed.
///
/// A decode failure after the first sampled token is not an error: the
/// generation ends early and keeps what it produced.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenize(#[from] TokenizerError),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Prompt too long: {tokens} tokens exceeds limit of {limit}")]
    PromptTooLong { tokens: usize, limit: usize },

    #[error("Prefill failed: {0}")]
    Prefill(#[source] DecodeError),
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenize(#[from] TokenizerError),

    #[error("Model does not expose embeddings")]
    Unsupported,

    #[error("Prefill failed: {0}")]
    Prefill(#[source] DecodeError),

    #[error("Engine returned no embedding buffer")]
    Missing,

    #[error("Embedding has zero or non-finite norm")]
    Degenerate,
}

/// Reading a [`SessionConfig`](crate::config::SessionConfig) file failed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
