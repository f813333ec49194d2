//! Inference session management.
//!
//! A [`Session`] owns at most one loaded model/context pair and serializes
//! every engine call behind a single mutex. Generation holds that mutex for
//! its whole decode loop; [`Session::request_stop`] and
//! [`Session::is_generating`] stay usable from other threads because they
//! only touch the [`GenerationController`].
//!
//! Sessions are created and destroyed explicitly by their owner. Share one
//! across threads as `Arc<Session<E>>`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use llama_engine::{ContextParams, Engine, EngineError, ModelParams, TokenId};
use llama_runtime::{LogTelemetry, TelemetryHook};
use llama_sampling::Sampler;
use llama_tokenizer::TokenCodec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{GenerationParams, ParamOverrides, SessionConfig};
use crate::control::GenerationController;
use crate::embedding::EmbeddingExtractor;
use crate::error::{EmbeddingError, GenerateError, LoadError, TokenizerError};
use crate::generation::{Generation, GenerationLoop};

/// Returned by [`Session::model_description`] when nothing is loaded.
pub const NO_MODEL: &str = "No model loaded";

/// A single inference session over an engine.
pub struct Session<E: Engine> {
    id: Uuid,
    engine: E,
    config: SessionConfig,
    state: Mutex<SessionState<E>>,
    controller: GenerationController,
    telemetry: Arc<dyn TelemetryHook>,
}

/// Everything guarded by the session mutex.
struct SessionState<E: Engine> {
    loaded: Option<Loaded<E>>,
    defaults: GenerationParams,
    backend_ready: bool,
}

/// A live model/context pair. Both handles exist or neither does.
struct Loaded<E: Engine> {
    model: E::Model,
    ctx: E::Context,
    sampler: Sampler,
    path: PathBuf,
}

impl<E: Engine> Session<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, SessionConfig::default())
    }

    pub fn with_config(engine: E, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(session = %id, "session created");
        Self {
            id,
            engine,
            state: Mutex::new(SessionState {
                loaded: None,
                defaults: config.defaults,
                backend_ready: false,
            }),
            config,
            controller: GenerationController::new(),
            telemetry: Arc::new(LogTelemetry::new()),
        }
    }

    /// Replace the hook that receives per-generation metrics.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SessionState<E>> {
        // Handles are only ever replaced whole, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load a model and create its context, replacing anything already loaded.
    ///
    /// `None` (or 0) for `context_size` / `thread_count` uses the session
    /// default. On success the effective values become the new defaults. On
    /// failure nothing is left loaded.
    pub fn load(
        &self,
        path: impl AsRef<Path>,
        context_size: Option<usize>,
        thread_count: Option<usize>,
    ) -> Result<(), LoadError> {
        let path = path.as_ref();
        let mut state = self.lock();
        self.unload_locked(&mut state);

        match llama_runtime::available_memory() {
            Some(bytes) => info!(session = %self.id, available_mb = bytes / (1024 * 1024), "available memory"),
            None => debug!(session = %self.id, "available memory unknown"),
        }

        if !state.backend_ready {
            self.engine.backend_init();
            state.backend_ready = true;
        }

        let n_ctx = context_size.filter(|&n| n > 0).unwrap_or(state.defaults.context_size);
        let n_threads = thread_count.filter(|&n| n > 0).unwrap_or(state.defaults.thread_count);
        let ctx_arg = u32::try_from(n_ctx).map_err(|_| {
            error!(session = %self.id, n_ctx, "context size out of range");
            LoadError::Context(EngineError::ContextCreate(format!("context size {n_ctx} exceeds {}", u32::MAX)))
        })?;

        let model_params = ModelParams {
            use_mmap: self.config.use_mmap,
            use_mlock: self.config.use_mlock,
        };
        let model = self.engine.load_model(path, &model_params).map_err(|source| {
            error!(session = %self.id, path = %path.display(), error = %source, "model load failed");
            LoadError::Model {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let seed = self.config.seed.unwrap_or_else(clock_seed);
        let ctx_params = ContextParams {
            n_ctx: ctx_arg,
            n_threads: thread_arg(n_threads),
            n_threads_batch: thread_arg(n_threads),
            // The engine seeds from the low 32 bits.
            seed: seed as u32,
            embeddings: true,
        };
        let ctx = match self.engine.create_context(&model, &ctx_params) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.engine.free_model(model);
                error!(session = %self.id, error = %e, "context creation failed; model freed");
                return Err(LoadError::Context(e));
            }
        };

        state.defaults.context_size = self.engine.n_ctx(&ctx);
        state.defaults.thread_count = n_threads;
        let sampler = Sampler::new(state.defaults.sampling(self.config.repeat_last_n)).with_seed(seed);

        info!(
            session = %self.id,
            path = %path.display(),
            description = %self.engine.model_description(&model),
            n_ctx = state.defaults.context_size,
            n_threads,
            "model loaded"
        );
        state.loaded = Some(Loaded {
            model,
            ctx,
            sampler,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Free the context, then the model. A no-op when nothing is loaded.
    pub fn unload(&self) {
        let mut state = self.lock();
        self.unload_locked(&mut state);
    }

    fn unload_locked(&self, state: &mut SessionState<E>) {
        if let Some(loaded) = state.loaded.take() {
            self.engine.free_context(loaded.ctx);
            self.engine.free_model(loaded.model);
            info!(session = %self.id, path = %loaded.path.display(), "model unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded.is_some()
    }

    /// Unload and tear down the engine backend. Consumes the session, so the
    /// backend is freed at most once.
    pub fn shutdown(self) {
        let mut state = self.lock();
        self.unload_locked(&mut state);
        if state.backend_ready {
            self.engine.backend_free();
            state.backend_ready = false;
            info!(session = %self.id, "backend freed");
        }
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Generate a continuation of `prompt` with the given overrides.
    pub fn generate(&self, prompt: &str, overrides: &ParamOverrides) -> Result<Generation, GenerateError> {
        self.generate_with(prompt, overrides, &CancellationToken::new(), |_| {})
    }

    /// Generate with a caller-owned cancellation token and a streaming callback.
    ///
    /// `cancel` is polled together with the session's own stop token once per
    /// produced token. `on_text` receives text as it completes.
    pub fn generate_with<F>(
        &self,
        prompt: &str,
        overrides: &ParamOverrides,
        cancel: &CancellationToken,
        on_text: F,
    ) -> Result<Generation, GenerateError>
    where
        F: FnMut(&str),
    {
        let mut state = self.lock();
        let guard = self.controller.begin();

        let SessionState { loaded, defaults, .. } = &mut *state;
        let loaded = loaded.as_mut().ok_or(GenerateError::NotLoaded)?;
        let params = defaults.resolve(overrides);
        debug!(session = %self.id, ?params, prompt_len = prompt.len(), "generate");

        let threads_changed = params.thread_count != defaults.thread_count;
        if threads_changed {
            let n = thread_arg(params.thread_count);
            self.engine.set_threads(&mut loaded.ctx, n, n);
        }
        loaded.sampler.set_params(params.sampling(self.config.repeat_last_n));

        let result = GenerationLoop::new(&self.engine, &loaded.model).run(
            &mut loaded.ctx,
            &mut loaded.sampler,
            &params,
            prompt,
            Box::new(Arc::clone(&self.telemetry)),
            || guard.should_stop(cancel),
            on_text,
        );

        if threads_changed {
            let n = thread_arg(defaults.thread_count);
            self.engine.set_threads(&mut loaded.ctx, n, n);
        }
        result
    }

    /// Ask the running generation to stop. Returns immediately.
    pub fn request_stop(&self) {
        debug!(session = %self.id, "stop requested");
        self.controller.request_stop();
    }

    pub fn is_generating(&self) -> bool {
        self.controller.is_generating()
    }

    // -----------------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------------

    /// Normalized embedding of `text`, or `None` when it cannot be produced.
    pub fn embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.extract_embedding(text)
            .map_err(|e| debug!(session = %self.id, error = %e, "no embedding"))
            .ok()
    }

    pub fn extract_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut state = self.lock();
        let loaded = state.loaded.as_mut().ok_or(EmbeddingError::NotLoaded)?;
        EmbeddingExtractor::new(&self.engine, &loaded.model).extract(&mut loaded.ctx, text)
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Set the default thread count and apply it to the live context.
    /// 0 is ignored.
    pub fn set_thread_count(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.lock();
        state.defaults.thread_count = n;
        if let Some(loaded) = state.loaded.as_mut() {
            self.engine.set_threads(&mut loaded.ctx, thread_arg(n), thread_arg(n));
        }
        debug!(session = %self.id, n, "thread count set");
    }

    /// Merge `overrides` into the session defaults.
    pub fn set_default_params(&self, overrides: &ParamOverrides) {
        let mut state = self.lock();
        let previous_threads = state.defaults.thread_count;
        state.defaults = state.defaults.resolve(overrides);

        let n = state.defaults.thread_count;
        if n != previous_threads {
            if let Some(loaded) = state.loaded.as_mut() {
                self.engine.set_threads(&mut loaded.ctx, thread_arg(n), thread_arg(n));
            }
        }
        debug!(session = %self.id, defaults = ?state.defaults, "default params updated");
    }

    pub fn default_params(&self) -> GenerationParams {
        self.lock().defaults
    }

    // -----------------------------------------------------------------------
    // Token utilities
    // -----------------------------------------------------------------------

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, TokenizerError> {
        let state = self.lock();
        let loaded = state.loaded.as_ref().ok_or(TokenizerError::NotLoaded)?;
        TokenCodec::new(&self.engine, &loaded.model).tokenize(text, add_bos)
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String, TokenizerError> {
        let state = self.lock();
        let loaded = state.loaded.as_ref().ok_or(TokenizerError::NotLoaded)?;
        Ok(TokenCodec::new(&self.engine, &loaded.model).detokenize(tokens))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Context window of the live context; 0 when nothing is loaded.
    pub fn context_size(&self) -> usize {
        let state = self.lock();
        state.loaded.as_ref().map_or(0, |l| self.engine.n_ctx(&l.ctx))
    }

    pub fn vocab_size(&self) -> usize {
        let state = self.lock();
        state.loaded.as_ref().map_or(0, |l| self.engine.n_vocab(&l.model))
    }

    pub fn embedding_size(&self) -> usize {
        let state = self.lock();
        state.loaded.as_ref().map_or(0, |l| self.engine.n_embd(&l.model))
    }

    pub fn model_description(&self) -> String {
        let state = self.lock();
        state
            .loaded
            .as_ref()
            .map_or_else(|| NO_MODEL.to_string(), |l| self.engine.model_description(&l.model))
    }

    /// Available system memory in bytes; 0 when unknown.
    pub fn available_memory(&self) -> u64 {
        llama_runtime::available_memory().unwrap_or(0)
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(loaded) = state.loaded.take() {
            self.engine.free_context(loaded.ctx);
            self.engine.free_model(loaded.model);
        }
    }
}

/// Thread counts beyond `u32::MAX` are clamped.
fn thread_arg(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42)
}
