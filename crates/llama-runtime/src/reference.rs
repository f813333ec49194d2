//! Deterministic in-process [`Engine`] implementation.
//!
//! Stands in for a native inference library so the session manager can be
//! driven end to end without real weights. A "model file" is a small JSON
//! [`ModelManifest`]; the vocabulary is 256 byte tokens, BOS, EOS and then the
//! manifest's multi-byte pieces.
//!
//! Scores are a pure function of the cached token history (last few tokens
//! plus position), so prefilling `[a, b, c]` leaves the context in the same
//! state as prefilling `[a]` and stepping `b` then `c`.
//!
//! The engine also carries fault injection and counters for tests: context
//! creation failure, decode failure on the n-th call, a per-decode delay, and
//! live handle counts.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llama_engine::{
    Batch, ContextParams, Engine, EngineError, ModelParams, Result, TokenCount, TokenId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mmap::MappedFile;

/// Number of single-byte tokens at the start of the vocabulary.
pub const BYTE_TOKENS: usize = 256;

pub const BOS_ID: TokenId = 256;

pub const EOS_ID: TokenId = 257;

/// Id of the first manifest piece.
pub const FIRST_PIECE_ID: TokenId = 258;

/// How many trailing tokens feed the score hash.
const SCORE_WINDOW: usize = 4;

/// Score given to EOS once the manifest's `eos_at` position is reached.
const EOS_SCORE: f32 = 50.0;

/// Contents of a reference model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelManifest {
    /// Returned by `model_description`.
    pub description: String,

    /// Extra multi-byte vocabulary entries, matched greedily longest-first.
    pub pieces: Vec<String>,

    /// Embedding dimension. 0 means the model exposes no embeddings.
    pub n_embd: usize,

    /// Whether a context produces an embedding buffer after decode.
    pub embeddings: bool,

    /// Multiplier on embedding components. 0.0 yields all-zero vectors.
    pub embedding_scale: f32,

    /// Context size used when the caller asks for 0.
    pub n_ctx_train: usize,

    /// Once the context holds this many positions, EOS becomes the top score.
    /// EOS is never produced otherwise.
    pub eos_at: Option<usize>,

    /// Seed for the score and embedding hashes.
    pub seed: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            description: "reference byte-level 0.3K".to_string(),
            pieces: Vec::new(),
            n_embd: 32,
            embeddings: true,
            embedding_scale: 1.0,
            n_ctx_train: 4096,
            eos_at: None,
            seed: 0x5eed,
        }
    }
}

impl ModelManifest {
    /// Serialize and write the manifest to `path`.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }
}

/// Loaded reference model. Cheap to share with the contexts created from it.
pub struct ReferenceModel {
    data: Arc<ModelData>,
}

impl ReferenceModel {
    pub fn manifest(&self) -> &ModelManifest {
        &self.data.manifest
    }
}

struct ModelData {
    manifest: ModelManifest,
    pieces: Vec<Vec<u8>>,
    /// Piece indices, longest piece first.
    by_len: Vec<usize>,
}

impl ModelData {
    fn new(manifest: ModelManifest) -> Self {
        let pieces: Vec<Vec<u8>> = manifest
            .pieces
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .filter(|p| !p.is_empty())
            .collect();
        let mut by_len: Vec<usize> = (0..pieces.len()).collect();
        by_len.sort_by(|&a, &b| pieces[b].len().cmp(&pieces[a].len()));
        Self {
            manifest,
            pieces,
            by_len,
        }
    }

    fn n_vocab(&self) -> usize {
        FIRST_PIECE_ID as usize + self.pieces.len()
    }

    fn encode(&self, text: &str) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let matched = self
                .by_len
                .iter()
                .copied()
                .find(|&idx| bytes[i..].starts_with(&self.pieces[idx]));
            match matched {
                Some(idx) => {
                    ids.push(FIRST_PIECE_ID + idx as TokenId);
                    i += self.pieces[idx].len();
                }
                None => {
                    ids.push(bytes[i] as TokenId);
                    i += 1;
                }
            }
        }
        ids
    }

    fn piece(&self, token: TokenId) -> &[u8] {
        match token {
            t if (0..BYTE_TOKENS as TokenId).contains(&t) => {
                std::slice::from_ref(&BYTE_TABLE[t as usize])
            }
            t if t >= FIRST_PIECE_ID => self
                .pieces
                .get((t - FIRST_PIECE_ID) as usize)
                .map(|p| p.as_slice())
                .unwrap_or(&[]),
            // BOS, EOS and negative ids render as nothing
            _ => &[],
        }
    }

    fn scores(&self, history: &[TokenId]) -> Vec<f32> {
        let mut h = self.manifest.seed;
        for &t in history.iter().rev().take(SCORE_WINDOW) {
            h = mix(h ^ t as u64);
        }
        h = mix(h ^ history.len() as u64);

        let mut scores: Vec<f32> = (0..self.n_vocab())
            .map(|i| unit(mix(h ^ i as u64)) * 8.0 - 4.0)
            .collect();

        scores[BOS_ID as usize] = f32::NEG_INFINITY;
        scores[EOS_ID as usize] = match self.manifest.eos_at {
            Some(at) if history.len() >= at => EOS_SCORE,
            _ => f32::NEG_INFINITY,
        };
        scores
    }

    fn embedding(&self, history: &[TokenId]) -> Vec<f32> {
        let mut h = self.manifest.seed ^ 0x00e3_b0c4;
        for &t in history {
            h = mix(h ^ t as u64);
        }
        (0..self.manifest.n_embd)
            .map(|j| (unit(mix(h ^ j as u64)) - 0.5) * self.manifest.embedding_scale)
            .collect()
    }
}

static BYTE_TABLE: [u8; BYTE_TOKENS] = {
    let mut table = [0u8; BYTE_TOKENS];
    let mut i = 0;
    while i < BYTE_TOKENS {
        table[i] = i as u8;
        i += 1;
    }
    table
};

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Map a hash to [0, 1).
fn unit(h: u64) -> f32 {
    (h >> 40) as f32 / (1u64 << 24) as f32
}

/// Decoding state for one reference context.
pub struct ReferenceContext {
    model: Arc<ModelData>,
    n_ctx: usize,
    n_threads: u32,
    n_threads_batch: u32,
    embeddings: bool,
    /// KV cache: the token held at each position.
    cells: Vec<TokenId>,
    logits: Option<Vec<f32>>,
    embedding: Option<Vec<f32>>,
}

impl ReferenceContext {
    /// Positions currently held in the KV cache.
    pub fn cached(&self) -> usize {
        self.cells.len()
    }

    pub fn threads(&self) -> (u32, u32) {
        (self.n_threads, self.n_threads_batch)
    }
}

/// The reference engine. All state is atomic, so one instance can be shared.
#[derive(Debug, Default)]
pub struct ReferenceEngine {
    decode_delay: Duration,
    fail_context: AtomicBool,
    /// 1-based decode call that fails; 0 = never.
    fail_decode_at: AtomicUsize,
    decode_calls: AtomicUsize,
    live_models: AtomicUsize,
    live_contexts: AtomicUsize,
    backend_inits: AtomicUsize,
    backend_frees: AtomicUsize,
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every decode call.
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    /// Make every subsequent `create_context` fail.
    pub fn set_fail_context(&self, fail: bool) {
        self.fail_context.store(fail, Ordering::SeqCst);
    }

    /// Fail the `n`-th decode call counted from engine creation (1-based).
    /// `None` disables the fault.
    pub fn set_fail_decode_at(&self, n: Option<usize>) {
        self.fail_decode_at.store(n.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn live_models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    pub fn backend_inits(&self) -> usize {
        self.backend_inits.load(Ordering::SeqCst)
    }

    pub fn backend_frees(&self) -> usize {
        self.backend_frees.load(Ordering::SeqCst)
    }

    fn read_manifest(path: &Path, params: &ModelParams) -> Result<ModelManifest> {
        let parsed = if params.use_mmap {
            let mapped = MappedFile::open(path)?;
            serde_json::from_slice(mapped.as_bytes())
        } else {
            let bytes = fs::read(path).map_err(|e| {
                EngineError::ModelLoad(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_slice(&bytes)
        };
        parsed.map_err(|e| {
            EngineError::ModelLoad(format!("incompatible model file {}: {e}", path.display()))
        })
    }
}

impl Engine for ReferenceEngine {
    type Model = ReferenceModel;
    type Context = ReferenceContext;

    fn backend_init(&self) {
        self.backend_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn backend_free(&self) {
        self.backend_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ReferenceModel> {
        if params.use_mlock {
            debug!("mlock requested; reference models are never pinned");
        }
        let manifest = Self::read_manifest(path, params)?;
        self.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(ReferenceModel {
            data: Arc::new(ModelData::new(manifest)),
        })
    }

    fn create_context(&self, model: &ReferenceModel, params: &ContextParams) -> Result<ReferenceContext> {
        if self.fail_context.load(Ordering::SeqCst) {
            return Err(EngineError::ContextCreate("injected failure".to_string()));
        }
        let n_ctx = match params.n_ctx as usize {
            0 => model.data.manifest.n_ctx_train,
            n => n,
        };
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(ReferenceContext {
            model: Arc::clone(&model.data),
            n_ctx,
            n_threads: params.n_threads,
            n_threads_batch: params.n_threads_batch,
            embeddings: params.embeddings,
            cells: Vec::new(),
            logits: None,
            embedding: None,
        })
    }

    fn free_context(&self, ctx: ReferenceContext) {
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        drop(ctx);
    }

    fn free_model(&self, model: ReferenceModel) {
        self.live_models.fetch_sub(1, Ordering::SeqCst);
        drop(model);
    }

    fn tokenize(&self, model: &ReferenceModel, text: &str, add_bos: bool, out: &mut [TokenId]) -> TokenCount {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_bos {
            ids.push(BOS_ID);
        }
        ids.extend(model.data.encode(text));

        if ids.len() > out.len() {
            return TokenCount::Needed(ids.len());
        }
        out[..ids.len()].copy_from_slice(&ids);
        TokenCount::Filled(ids.len())
    }

    fn token_to_piece(&self, model: &ReferenceModel, token: TokenId, buf: &mut [u8]) -> usize {
        let piece = model.data.piece(token);
        let n = piece.len().min(buf.len());
        buf[..n].copy_from_slice(&piece[..n]);
        n
    }

    fn decode(&self, ctx: &mut ReferenceContext, batch: &Batch) -> Result<()> {
        let call = self.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }
        if self.fail_decode_at.load(Ordering::SeqCst) == call {
            return Err(EngineError::Decode(-1));
        }
        if batch.is_empty() {
            return Err(EngineError::InvalidBatch("empty batch".to_string()));
        }

        // Validate every entry before touching the cache.
        for (i, &pos) in batch.positions().iter().enumerate() {
            let expected = ctx.cells.len() + i;
            if pos < 0 || pos as usize != expected {
                return Err(EngineError::InvalidBatch(format!(
                    "position {pos} is not contiguous (expected {expected})"
                )));
            }
            if expected >= ctx.n_ctx {
                // No free KV slot
                return Err(EngineError::Decode(1));
            }
        }

        let mut last_output = None;
        for (token, pos, _seq, wants_logits) in batch.entries() {
            ctx.cells.push(token);
            if wants_logits {
                last_output = Some(pos as usize);
            }
        }

        ctx.logits = last_output.map(|pos| ctx.model.scores(&ctx.cells[..=pos]));
        ctx.embedding = (ctx.embeddings
            && ctx.model.manifest.embeddings
            && ctx.model.manifest.n_embd > 0)
            .then(|| ctx.model.embedding(&ctx.cells));
        Ok(())
    }

    fn logits<'a>(&self, ctx: &'a ReferenceContext) -> Option<&'a [f32]> {
        ctx.logits.as_deref()
    }

    fn embeddings<'a>(&self, ctx: &'a ReferenceContext) -> Option<&'a [f32]> {
        ctx.embedding.as_deref()
    }

    fn clear_kv_cache(&self, ctx: &mut ReferenceContext) {
        ctx.cells.clear();
        ctx.logits = None;
        ctx.embedding = None;
    }

    fn set_threads(&self, ctx: &mut ReferenceContext, n_threads: u32, n_threads_batch: u32) {
        ctx.n_threads = n_threads;
        ctx.n_threads_batch = n_threads_batch;
    }

    fn n_vocab(&self, model: &ReferenceModel) -> usize {
        model.data.n_vocab()
    }

    fn n_embd(&self, model: &ReferenceModel) -> usize {
        model.data.manifest.n_embd
    }

    fn n_ctx(&self, ctx: &ReferenceContext) -> usize {
        ctx.n_ctx
    }

    fn token_bos(&self, _model: &ReferenceModel) -> TokenId {
        BOS_ID
    }

    fn token_eos(&self, _model: &ReferenceModel) -> TokenId {
        EOS_ID
    }

    fn model_description(&self, model: &ReferenceModel) -> String {
        model.data.manifest.description.clone()
    }
}
