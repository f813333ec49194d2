//! # llama-cli
//!
//! Command-line host for a [`Session`] over the reference engine.
//!
//! Generation runs on a worker thread and streams text back through a
//! bounded channel, so the calling thread stays free to enforce a timeout
//! with [`Session::request_stop`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use llama_bridge::{
    CancellationToken, ConfigError, EmbeddingError, GenerateError, Generation, LoadError, ParamOverrides, Session,
    SessionConfig, TokenId, TokenizerError,
};
use llama_runtime::ReferenceEngine;
use tracing::{debug, warn};

/// Streamed text chunks buffered before the worker blocks.
const STREAM_CAPACITY: usize = 256;

/// How often the receiving thread wakes to check its deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors surfaced by the command-line host.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),
    #[error("generation worker panicked")]
    Worker,
}

/// Options shared by every subcommand that loads a model.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub model: PathBuf,
    pub config: Option<PathBuf>,
    pub context_size: Option<usize>,
    pub thread_count: Option<usize>,
}

impl LoadOptions {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Per-call overrides from command-line flags. Zero or negative values
/// fall back to the session defaults.
pub fn overrides(max_tokens: Option<usize>, temperature: Option<f32>) -> ParamOverrides {
    ParamOverrides {
        max_tokens,
        temperature,
        ..ParamOverrides::default()
    }
    .sanitized()
}

/// Build a session over `engine` and load the requested model.
pub fn open_session(engine: ReferenceEngine, opts: &LoadOptions) -> Result<Session<ReferenceEngine>, CliError> {
    let config = match &opts.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    let session = Session::with_config(engine, config);
    session.load(&opts.model, opts.context_size, opts.thread_count)?;
    Ok(session)
}

/// Run a generation on a worker thread, handing streamed text to `sink`.
///
/// With a `timeout`, the calling thread asks the session to stop once the
/// deadline passes and keeps draining the stream until the worker is done.
pub fn generate_streaming(
    session: Arc<Session<ReferenceEngine>>,
    prompt: &str,
    overrides: ParamOverrides,
    timeout: Option<Duration>,
    mut sink: impl FnMut(&str),
) -> Result<Generation, CliError> {
    let (tx, rx) = bounded::<String>(STREAM_CAPACITY);

    let worker = {
        let session = Arc::clone(&session);
        let prompt = prompt.to_owned();
        thread::Builder::new()
            .name("generation".into())
            .spawn(move || {
                session.generate_with(&prompt, &overrides, &CancellationToken::new(), |text| {
                    // The receiver outlives the worker; a failed send only
                    // means the host stopped listening.
                    let _ = tx.send(text.to_owned());
                })
            })
            .map_err(|_| CliError::Worker)?
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut stopping = false;
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(text) => sink(&text),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if expired && session.is_generating() {
            if !stopping {
                warn!(session = %session.id(), "timeout reached, stopping generation");
                stopping = true;
            }
            session.request_stop();
        }
    }

    let generation = worker.join().map_err(|_| CliError::Worker)??;
    debug!(
        session = %session.id(),
        tokens = generation.tokens.len(),
        stop_reason = %generation.stop_reason,
        "generation finished"
    );
    Ok(generation)
}

pub fn embed(session: &Session<ReferenceEngine>, text: &str) -> Result<Vec<f32>, CliError> {
    Ok(session.extract_embedding(text)?)
}

pub fn tokenize(session: &Session<ReferenceEngine>, text: &str, add_bos: bool) -> Result<Vec<TokenId>, CliError> {
    Ok(session.tokenize(text, add_bos)?)
}

/// Summary of a loaded model, printed by `info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub description: String,
    pub vocab_size: usize,
    pub context_size: usize,
    pub embedding_size: usize,
    pub available_memory: u64,
}

impl ModelInfo {
    pub fn collect(session: &Session<ReferenceEngine>, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            description: session.model_description(),
            vocab_size: session.vocab_size(),
            context_size: session.context_size(),
            embedding_size: session.embedding_size(),
            available_memory: session.available_memory(),
        }
    }
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "model:       {}", self.path.display())?;
        writeln!(f, "description: {}", self.description)?;
        writeln!(f, "vocab:       {}", self.vocab_size)?;
        writeln!(f, "context:     {}", self.context_size)?;
        writeln!(f, "embedding:   {}", self.embedding_size)?;
        write!(f, "memory:      {} MiB available", self.available_memory / (1024 * 1024))
    }
}

/// Render a vector as a bracketed, comma-separated list.
pub fn format_vector(values: &[f32]) -> String {
    let items: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
    format!("[{}]", items.join(", "))
}
