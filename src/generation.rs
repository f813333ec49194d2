//! The autoregressive generation loop.
//!
//! One call runs: tokenize (with BOS) → length check → clear KV cache →
//! prefill → repeat {stop check → sample → end-of-sequence check → step}.
//! Decode and sampling failures after prefill end the loop early and keep
//! the tokens already produced.

use llama_engine::{Engine, TokenId};
use llama_runtime::{InferenceMetrics, InferenceTimer, TelemetryHook};
use llama_sampling::Sampler;
use llama_tokenizer::{DecodingState, TokenCodec};
use tracing::{debug, error, info, warn};

use crate::config::GenerationParams;
use crate::decoder::BatchDecoder;
use crate::error::GenerateError;

pub use llama_runtime::StopReason;

/// Tokens held back from the context window when checking prompt length.
pub const PROMPT_MARGIN: usize = 4;

/// Output of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Detokenized output, prompt excluded.
    pub text: String,
    /// Generated token ids, prompt and end-of-sequence excluded.
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub stop_reason: StopReason,
    pub metrics: InferenceMetrics,
}

pub struct GenerationLoop<'a, E: Engine> {
    engine: &'a E,
    model: &'a E::Model,
}

impl<'a, E: Engine> GenerationLoop<'a, E> {
    pub fn new(engine: &'a E, model: &'a E::Model) -> Self {
        Self { engine, model }
    }

    /// Generate a continuation of `prompt`.
    ///
    /// `should_stop` is polled once per produced token. `on_text` receives
    /// streamed text in complete UTF-8 characters.
    #[allow(clippy::too_many_arguments)]
    pub fn run<S, F>(
        &self,
        ctx: &mut E::Context,
        sampler: &mut Sampler,
        params: &GenerationParams,
        prompt: &str,
        hook: Box<dyn TelemetryHook>,
        should_stop: S,
        mut on_text: F,
    ) -> Result<Generation, GenerateError>
    where
        S: Fn() -> bool,
        F: FnMut(&str),
    {
        let codec = TokenCodec::new(self.engine, self.model);
        let decoder = BatchDecoder::new(self.engine);

        let prompt_tokens = codec.tokenize(prompt, true)?;
        if prompt_tokens.is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }

        let n_ctx = match params.context_size {
            0 => self.engine.n_ctx(ctx),
            n => n.min(self.engine.n_ctx(ctx)),
        };
        let limit = n_ctx.saturating_sub(PROMPT_MARGIN);
        if prompt_tokens.len() > limit {
            warn!(tokens = prompt_tokens.len(), limit, "prompt too long");
            return Err(GenerateError::PromptTooLong {
                tokens: prompt_tokens.len(),
                limit,
            });
        }

        let mut timer = InferenceTimer::new(prompt_tokens.len(), hook);
        self.engine.clear_kv_cache(ctx);
        decoder.prefill(ctx, &prompt_tokens).map_err(|e| {
            error!(error = %e, "prefill failed");
            GenerateError::Prefill(e)
        })?;
        timer.mark_prefill_complete();

        let eos = self.engine.token_eos(self.model);
        let mut history = prompt_tokens.clone();
        let mut output: Vec<TokenId> = Vec::with_capacity(params.max_tokens.min(n_ctx));
        let mut stream = DecodingState::new();
        let mut n_cur = prompt_tokens.len();
        let mut stop_reason = StopReason::MaxTokens;

        while output.len() < params.max_tokens {
            if should_stop() {
                stop_reason = StopReason::Cancelled;
                break;
            }

            let Some(logits) = self.engine.logits(ctx) else {
                warn!("engine returned no scores");
                stop_reason = StopReason::SamplingFailed;
                break;
            };
            let token = match sampler.sample(logits, &history) {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "sampling failed");
                    stop_reason = StopReason::SamplingFailed;
                    break;
                }
            };
            if token == eos {
                stop_reason = StopReason::StopToken;
                break;
            }

            output.push(token);
            history.push(token);
            timer.mark_token();
            let piece = codec.decode_token(token, &mut stream);
            if !piece.is_empty() {
                on_text(&piece);
            }

            if output.len() >= params.max_tokens {
                break;
            }
            if n_cur >= n_ctx {
                stop_reason = StopReason::ContextLength;
                break;
            }
            if let Err(e) = decoder.step(ctx, token, n_cur) {
                error!(error = %e, position = n_cur, "decode failed; returning partial output");
                stop_reason = StopReason::DecodeFailed;
                break;
            }
            timer.mark_step();
            n_cur += 1;
        }

        let tail = stream.flush();
        if !tail.is_empty() {
            on_text(&tail);
        }

        let metrics = timer.finish(stop_reason);
        let text = codec.detokenize(&output);
        info!(
            prompt_tokens = prompt_tokens.len(),
            generated_tokens = output.len(),
            stop_reason = %stop_reason,
            "generation finished"
        );
        debug!(step_decodes = metrics.step_decodes, ttft_ms = metrics.ttft_ms, "generation metrics");

        Ok(Generation {
            text,
            tokens: output,
            prompt_tokens: prompt_tokens.len(),
            stop_reason,
            metrics,
        })
    }
}
