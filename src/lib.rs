//! Single-session bridge between an application and a token-level
//! language-model engine.
//!
//! The crate manages the lifecycle of one loaded model and its context, runs
//! the prefill-and-decode generation loop with a fixed sampling pipeline,
//! extracts normalized embeddings, and lets another thread cancel a running
//! generation without waiting on the session lock.
//!
//! The engine itself is reached only through [`llama_engine::Engine`];
//! [`llama_runtime::ReferenceEngine`] is a deterministic in-process
//! implementation.

pub mod config;
pub mod control;
pub mod decoder;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod session;

pub use config::{GenerationParams, ParamOverrides, SessionConfig};
pub use error::{ConfigError, DecodeError, EmbeddingError, GenerateError, LoadError, TokenizerError};
pub use generation::{Generation, StopReason};
pub use session::Session;

pub use llama_engine::{Engine, TokenId};
pub use tokio_util::sync::CancellationToken;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
