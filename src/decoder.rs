//! Prefill and single-step decode requests.

use llama_engine::{Batch, Engine, Position, SeqId, TokenId};
use tracing::debug;

use crate::error::DecodeError;

/// Every request goes to sequence 0.
const SEQ_ID: SeqId = 0;

pub struct BatchDecoder<'a, E: Engine> {
    engine: &'a E,
}

impl<'a, E: Engine> BatchDecoder<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Submit the whole prompt as one batch at positions `0..n`.
    ///
    /// Scores are requested for the last position only.
    pub fn prefill(&self, ctx: &mut E::Context, tokens: &[TokenId]) -> Result<(), DecodeError> {
        let last = tokens.len().saturating_sub(1);
        let mut batch = Batch::with_capacity(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            batch.push(token, i as Position, SEQ_ID, i == last);
        }
        debug!(tokens = tokens.len(), "prefill");
        self.engine.decode(ctx, &batch)?;
        Ok(())
    }

    /// Submit one token at `position`, requesting its scores.
    pub fn step(&self, ctx: &mut E::Context, token: TokenId, position: usize) -> Result<(), DecodeError> {
        let mut batch = Batch::with_capacity(1);
        batch.push(token, position as Position, SEQ_ID, true);
        self.engine.decode(ctx, &batch)?;
        Ok(())
    }
}
