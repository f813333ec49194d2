//! Prefill-only embedding extraction.

use llama_engine::Engine;
use llama_tokenizer::TokenCodec;
use tracing::{debug, instrument};

use crate::decoder::BatchDecoder;
use crate::error::EmbeddingError;

pub struct EmbeddingExtractor<'a, E: Engine> {
    engine: &'a E,
    model: &'a E::Model,
}

impl<'a, E: Engine> EmbeddingExtractor<'a, E> {
    pub fn new(engine: &'a E, model: &'a E::Model) -> Self {
        Self { engine, model }
    }

    /// Embed `text` and return the L2-normalized vector.
    ///
    /// Clears the KV cache, prefills the text (with BOS) and reads the
    /// engine's embedding for the final position. No sampling happens.
    #[instrument(skip(self, ctx, text), fields(text_len = text.len()))]
    pub fn extract(&self, ctx: &mut E::Context, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let n_embd = self.engine.n_embd(self.model);
        if n_embd == 0 {
            return Err(EmbeddingError::Unsupported);
        }

        let tokens = TokenCodec::new(self.engine, self.model).tokenize(text, true)?;
        self.engine.clear_kv_cache(ctx);
        BatchDecoder::new(self.engine)
            .prefill(ctx, &tokens)
            .map_err(EmbeddingError::Prefill)?;

        let raw = self
            .engine
            .embeddings(ctx)
            .filter(|e| e.len() >= n_embd)
            .ok_or(EmbeddingError::Missing)?;
        debug!(tokens = tokens.len(), n_embd, "embedding extracted");

        l2_normalize(&raw[..n_embd]).ok_or(EmbeddingError::Degenerate)
    }
}

/// Divide each component by the vector's Euclidean norm.
///
/// Returns `None` for a zero or non-finite norm.
pub fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}
