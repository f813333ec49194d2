//! Per-generation measurements.
//!
//! A generation run is one prefill followed by single-token steps. The
//! [`InferenceTimer`] follows that shape: it is started with the prompt
//! length, told when prefill finished, when each token was accepted and when
//! each step decode went through, and closed with the [`StopReason`] that
//! ended the run. The resulting [`InferenceMetrics`] go to a
//! [`TelemetryHook`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Why a generation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Sampled the end-of-sequence token.
    StopToken,
    /// Reached the `max_tokens` limit.
    MaxTokens,
    /// The next position would fall outside the context window.
    ContextLength,
    /// A stop was requested, by the session or the caller's token.
    Cancelled,
    /// A single-step decode failed.
    DecodeFailed,
    /// The engine produced no scores, or none were usable.
    SamplingFailed,
}

impl StopReason {
    /// Ended by something other than the model or the configured limits.
    pub fn is_interrupted(self) -> bool {
        matches!(self, StopReason::Cancelled | StopReason::DecodeFailed | StopReason::SamplingFailed)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopToken => write!(f, "eos"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::ContextLength => write!(f, "context_length"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::DecodeFailed => write!(f, "decode_failed"),
            StopReason::SamplingFailed => write!(f, "sampling_failed"),
        }
    }
}

/// Summary of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Single-token decodes issued after prefill. One less than
    /// `generated_tokens` when the run stops at `max_tokens`, since the last
    /// token is never fed back.
    pub step_decodes: usize,
    /// Time from start until prefill scores were ready.
    pub ttft_ms: f64,
    pub total_time_ms: f64,
    /// Generated tokens over the time spent after prefill.
    pub tokens_per_sec: f64,
    pub stop_reason: StopReason,
}

impl fmt::Display for InferenceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} prompt + {} generated tokens, {}, ttft {:.1} ms, {:.1} tok/s",
            self.prompt_tokens, self.generated_tokens, self.stop_reason, self.ttft_ms, self.tokens_per_sec
        )
    }
}

/// Receives progress and the final summary of each run.
///
/// Every method defaults to a no-op. Hooks run on the generating thread
/// while it holds the session lock, so they should return quickly.
pub trait TelemetryHook: Send + Sync {
    fn on_prefill(&self, _prompt_tokens: usize, _elapsed: Duration) {}

    /// `index` counts accepted tokens from 1.
    fn on_token(&self, _index: usize, _elapsed: Duration) {}

    fn on_finish(&self, _metrics: &InferenceMetrics) {}
}

impl<T: TelemetryHook + ?Sized> TelemetryHook for Arc<T> {
    fn on_prefill(&self, prompt_tokens: usize, elapsed: Duration) {
        (**self).on_prefill(prompt_tokens, elapsed)
    }

    fn on_token(&self, index: usize, elapsed: Duration) {
        (**self).on_token(index, elapsed)
    }

    fn on_finish(&self, metrics: &InferenceMetrics) {
        (**self).on_finish(metrics)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs each finished run and remembers the latest one.
#[derive(Debug, Default)]
pub struct LogTelemetry {
    runs: AtomicUsize,
    interrupted: AtomicUsize,
    last: Mutex<Option<InferenceMetrics>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Finished runs seen so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    /// Runs that ended cancelled or on an engine failure.
    pub fn interrupted_runs(&self) -> usize {
        self.interrupted.load(Ordering::Relaxed)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_finish(&self, metrics: &InferenceMetrics) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if metrics.stop_reason.is_interrupted() {
            self.interrupted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            step_decodes = metrics.step_decodes,
            stop_reason = %metrics.stop_reason,
            tokens_per_sec = metrics.tokens_per_sec,
            "run finished"
        );
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
    }
}

/// Clock for one run. Consumed by [`finish`](Self::finish).
pub struct InferenceTimer {
    hook: Box<dyn TelemetryHook>,
    start: Instant,
    prompt_tokens: usize,
    prefill_done: Option<Duration>,
    generated: usize,
    step_decodes: usize,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            hook,
            start: Instant::now(),
            prompt_tokens,
            prefill_done: None,
            generated: 0,
            step_decodes: 0,
        }
    }

    pub fn mark_prefill_complete(&mut self) {
        let elapsed = self.start.elapsed();
        self.prefill_done = Some(elapsed);
        self.hook.on_prefill(self.prompt_tokens, elapsed);
    }

    /// A sampled token was kept.
    pub fn mark_token(&mut self) {
        self.generated += 1;
        self.hook.on_token(self.generated, self.start.elapsed());
    }

    /// A single-token decode succeeded.
    pub fn mark_step(&mut self) {
        self.step_decodes += 1;
    }

    pub fn finish(self, stop_reason: StopReason) -> InferenceMetrics {
        let total = self.start.elapsed();
        let prefill = self.prefill_done.unwrap_or_default();
        let decode_secs = total.saturating_sub(prefill).as_secs_f64();
        let tokens_per_sec = if self.generated > 0 && decode_secs > 0.0 {
            self.generated as f64 / decode_secs
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated,
            step_decodes: self.step_decodes,
            ttft_ms: prefill.as_secs_f64() * 1000.0,
            total_time_ms: total.as_secs_f64() * 1000.0,
            tokens_per_sec,
            stop_reason,
        };
        self.hook.on_finish(&metrics);
        metrics
    }
}
