//! # llama-engine
//!
//! The "narrow waist" between the session manager and a token-level inference
//! engine. Defines the [`Engine`] capability trait and the value types that
//! cross it. Implementations can wrap a native library (FFI) or run in process
//! without the session layer noticing.
//!
//! ## Design Notes
//!
//! ### Handles
//! A loaded model and its decoding context are associated types
//! ([`Engine::Model`], [`Engine::Context`]). The engine creates them and takes
//! them back through [`Engine::free_context`] / [`Engine::free_model`]; callers
//! own them in between. A context must be freed before the model it was
//! created from.
//!
//! ### Interior Mutability
//! Methods take `&self`. Per-context mutable state (KV cache, output buffers)
//! is reached through `&mut Self::Context`, so an engine with no global state
//! needs no locking of its own.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::path::Path;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Absolute position of a token inside a context.
pub type Position = i32;

/// Sequence tag attached to each batch entry.
pub type SeqId = i32;

/// Errors reported by an engine implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context creation failed: {0}")]
    ContextCreate(String),
    #[error("Decode failed with status {0}")]
    Decode(i32),
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
}

/// Parameters for loading model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    /// Map the weight file instead of reading it into owned memory.
    pub use_mmap: bool,
    /// Pin the weights in RAM.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Parameters for creating a decoding context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens.
    pub n_ctx: u32,
    /// Threads used for single-token decode.
    pub n_threads: u32,
    /// Threads used for batched (prefill) decode.
    pub n_threads_batch: u32,
    /// Seed for any engine-side randomness.
    pub seed: u32,
    /// Whether the context should expose embeddings after decode.
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_threads: 4,
            n_threads_batch: 4,
            seed: 0,
            embeddings: false,
        }
    }
}

/// Result of a tokenization request against a caller-supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCount {
    /// The buffer held the result; this many leading slots were written.
    Filled(usize),
    /// The buffer was too small; this many slots are required.
    Needed(usize),
}

/// A single decode request: tokens, their absolute positions, sequence tags and
/// per-token "scores wanted" flags.
///
/// Batches are cheap, built per decode call and then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<Position>,
    seq_ids: Vec<SeqId>,
    logits: Vec<bool>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(n),
            positions: Vec::with_capacity(n),
            seq_ids: Vec::with_capacity(n),
            logits: Vec::with_capacity(n),
        }
    }

    /// Append one entry.
    pub fn push(&mut self, token: TokenId, position: Position, seq_id: SeqId, logits: bool) {
        self.tokens.push(token);
        self.positions.push(position);
        self.seq_ids.push(seq_id);
        self.logits.push(logits);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn seq_ids(&self) -> &[SeqId] {
        &self.seq_ids
    }

    /// Per-entry flags: `true` where the caller wants output scores.
    pub fn logits(&self) -> &[bool] {
        &self.logits
    }

    /// Number of entries that request output scores.
    pub fn output_count(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }

    /// Iterate `(token, position, seq_id, logits)` tuples in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (TokenId, Position, SeqId, bool)> + '_ {
        self.tokens
            .iter()
            .zip(&self.positions)
            .zip(&self.seq_ids)
            .zip(&self.logits)
            .map(|(((&t, &p), &s), &l)| (t, p, s, l))
    }
}

/// The capability set the session manager consumes.
///
/// Everything the core knows about an inference engine goes through this
/// trait: handle lifecycle, tokenization against the engine's vocabulary,
/// batched decode, and read-back of scores and embeddings.
pub trait Engine: Send + Sync {
    /// Loaded weights and vocabulary. Immutable once loaded.
    type Model: Send;

    /// Per-session decoding state, including the KV cache.
    type Context: Send;

    /// One-time backend initialization. Called before the first load.
    fn backend_init(&self) {}

    /// Backend teardown. Called at most once, after every handle is freed.
    fn backend_free(&self) {}

    /// Load model weights from `path`.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model>;

    /// Create a decoding context for `model`.
    fn create_context(&self, model: &Self::Model, params: &ContextParams)
        -> Result<Self::Context>;

    fn free_context(&self, ctx: Self::Context) {
        drop(ctx);
    }

    fn free_model(&self, model: Self::Model) {
        drop(model);
    }

    /// Tokenize `text` into `out`.
    ///
    /// Returns [`TokenCount::Needed`] without writing when `out` is too small,
    /// so callers can size the buffer with an empty first call.
    fn tokenize(&self, model: &Self::Model, text: &str, add_bos: bool, out: &mut [TokenId])
        -> TokenCount;

    /// Write the surface bytes of `token` into `buf`, truncated to its length.
    /// Returns the number of bytes written.
    fn token_to_piece(&self, model: &Self::Model, token: TokenId, buf: &mut [u8]) -> usize;

    /// Run the model over `batch`, updating the KV cache.
    fn decode(&self, ctx: &mut Self::Context, batch: &Batch) -> Result<()>;

    /// Scores over the vocabulary for the last batch entry that requested them.
    fn logits<'a>(&self, ctx: &'a Self::Context) -> Option<&'a [f32]>;

    /// Embedding vector for the last decoded position, if the context exposes one.
    fn embeddings<'a>(&self, ctx: &'a Self::Context) -> Option<&'a [f32]>;

    /// Drop every cached position.
    fn clear_kv_cache(&self, ctx: &mut Self::Context);

    fn set_threads(&self, ctx: &mut Self::Context, n_threads: u32, n_threads_batch: u32);

    fn n_vocab(&self, model: &Self::Model) -> usize;

    /// Embedding dimension; 0 when the model exposes none.
    fn n_embd(&self, model: &Self::Model) -> usize;

    fn n_ctx(&self, ctx: &Self::Context) -> usize;

    fn token_bos(&self, model: &Self::Model) -> TokenId;

    fn token_eos(&self, model: &Self::Model) -> TokenId;

    /// Short human-readable description (architecture, size, quantization).
    fn model_description(&self, model: &Self::Model) -> String;
}

/// A shared engine is still an engine; handles are created by the inner one.
impl<E: Engine> Engine for Arc<E> {
    type Model = E::Model;
    type Context = E::Context;

    fn backend_init(&self) {
        (**self).backend_init()
    }

    fn backend_free(&self) {
        (**self).backend_free()
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model> {
        (**self).load_model(path, params)
    }

    fn create_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context> {
        (**self).create_context(model, params)
    }

    fn free_context(&self, ctx: Self::Context) {
        (**self).free_context(ctx)
    }

    fn free_model(&self, model: Self::Model) {
        (**self).free_model(model)
    }

    fn tokenize(&self, model: &Self::Model, text: &str, add_bos: bool, out: &mut [TokenId]) -> TokenCount {
        (**self).tokenize(model, text, add_bos, out)
    }

    fn token_to_piece(&self, model: &Self::Model, token: TokenId, buf: &mut [u8]) -> usize {
        (**self).token_to_piece(model, token, buf)
    }

    fn decode(&self, ctx: &mut Self::Context, batch: &Batch) -> Result<()> {
        (**self).decode(ctx, batch)
    }

    fn logits<'a>(&self, ctx: &'a Self::Context) -> Option<&'a [f32]> {
        (**self).logits(ctx)
    }

    fn embeddings<'a>(&self, ctx: &'a Self::Context) -> Option<&'a [f32]> {
        (**self).embeddings(ctx)
    }

    fn clear_kv_cache(&self, ctx: &mut Self::Context) {
        (**self).clear_kv_cache(ctx)
    }

    fn set_threads(&self, ctx: &mut Self::Context, n_threads: u32, n_threads_batch: u32) {
        (**self).set_threads(ctx, n_threads, n_threads_batch)
    }

    fn n_vocab(&self, model: &Self::Model) -> usize {
        (**self).n_vocab(model)
    }

    fn n_embd(&self, model: &Self::Model) -> usize {
        (**self).n_embd(model)
    }

    fn n_ctx(&self, ctx: &Self::Context) -> usize {
        (**self).n_ctx(ctx)
    }

    fn token_bos(&self, model: &Self::Model) -> TokenId {
        (**self).token_bos(model)
    }

    fn token_eos(&self, model: &Self::Model) -> TokenId {
        (**self).token_eos(model)
    }

    fn model_description(&self, model: &Self::Model) -> String {
        (**self).model_description(model)
    }
}
