//! # llama-tokenizer
//!
//! Text ↔ token conversion against an engine's vocabulary.
//!
//! This crate provides:
//! - [`TokenCodec`]: tokenize/detokenize through any [`Engine`]
//! - [`DecodingState`]: streaming detokenization with UTF-8 handling
//!
//! Tokenization uses a two-phase protocol: an empty-buffer size query, then a
//! fill into a buffer of exactly the reported size. Detokenization renders
//! each token into at most [`MAX_PIECE_BYTES`] bytes; longer surface forms are
//! truncated.

use llama_engine::{Engine, TokenCount, TokenId};

/// Per-token byte bound used when rendering surface forms.
pub const MAX_PIECE_BYTES: usize = 256;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Model not loaded")]
    NotLoaded,
    #[error("Engine asked for {needed} tokens after sizing the buffer for {sized}")]
    SizeMismatch { sized: usize, needed: usize },
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Tokenizer bound to one engine and one loaded model.
pub struct TokenCodec<'a, E: Engine> {
    engine: &'a E,
    model: &'a E::Model,
}

impl<'a, E: Engine> TokenCodec<'a, E> {
    pub fn new(engine: &'a E, model: &'a E::Model) -> Self {
        Self { engine, model }
    }

    /// Encode text into token ids, optionally prefixed with BOS.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>> {
        let sized = match self.engine.tokenize(self.model, text, add_bos, &mut []) {
            TokenCount::Filled(_) => return Ok(Vec::new()),
            TokenCount::Needed(n) => n,
        };

        let mut tokens = vec![0; sized];
        match self.engine.tokenize(self.model, text, add_bos, &mut tokens) {
            TokenCount::Filled(n) => {
                tokens.truncate(n);
                Ok(tokens)
            }
            TokenCount::Needed(needed) => Err(TokenizerError::SizeMismatch { sized, needed }),
        }
    }

    /// Surface bytes of one token, truncated to [`MAX_PIECE_BYTES`].
    pub fn piece(&self, token: TokenId) -> Vec<u8> {
        let mut buf = [0u8; MAX_PIECE_BYTES];
        let n = self.engine.token_to_piece(self.model, token, &mut buf);
        buf[..n.min(MAX_PIECE_BYTES)].to_vec()
    }

    /// Decode a complete sequence of tokens into text.
    ///
    /// Bytes are concatenated before UTF-8 decoding, so a character split
    /// across tokens survives. Invalid sequences become U+FFFD.
    pub fn detokenize(&self, tokens: &[TokenId]) -> String {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        for &token in tokens {
            bytes.extend_from_slice(&self.piece(token));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Decode a single token and accumulate it into `state`.
    ///
    /// Returns only the complete characters that became available; an
    /// incomplete UTF-8 tail waits in `state` for the next token.
    pub fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> String {
        state.push_bytes(&self.piece(token))
    }

    pub fn vocab_size(&self) -> usize {
        self.engine.n_vocab(self.model)
    }
}

/// Streaming decoding state for handling partial UTF-8 sequences.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> &[u8] {
        &self.pending_utf8
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
    }

    /// Append raw bytes and return the newly completed text.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_utf8) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending_utf8[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_utf8.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete tail; wait for more bytes.
                            self.pending_utf8.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        self.buffer.push_str(&out);
        out
    }

    /// Emit whatever is still pending, replacing an incomplete tail with U+FFFD.
    pub fn flush(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        self.buffer.push_str(&out);
        out
    }
}
