//! Generation loop tests.
//!
//! Validates:
//! - greedy generation is deterministic across repeated runs
//! - prompts longer than the context window minus 4 are rejected before any decode
//! - every stop condition: max tokens, end-of-sequence, context full, decode failure
//! - prefill failure is an error, later decode failures keep partial output
//! - zero and negative overrides mean "use the default" on every path
//! - streamed text matches the final text; metrics match the output

mod common;

use std::sync::{Arc, Mutex};

use common::{loaded_session, session_with, write_model};
use llama_bridge::generation::PROMPT_MARGIN;
use llama_bridge::{GenerateError, ParamOverrides, Session, SessionConfig, StopReason};
use llama_runtime::reference::EOS_ID;
use llama_runtime::{LogTelemetry, ModelManifest, ReferenceEngine};

fn greedy(max_tokens: usize) -> ParamOverrides {
    ParamOverrides::greedy().with_max_tokens(max_tokens)
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn hello_is_identical_across_ten_runs() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 2048);

    let first = session.generate("Hello", &greedy(5)).unwrap();
    assert_eq!(first.tokens.len(), 5);
    assert_eq!(first.stop_reason, StopReason::MaxTokens);

    for _ in 0..10 {
        let again = session.generate("Hello", &greedy(5)).unwrap();
        assert_eq!(again.tokens, first.tokens);
        assert_eq!(again.text, first.text);
    }
}

#[test]
fn seeded_sampling_is_reproducible_across_sessions() {
    let overrides = ParamOverrides::default().with_temperature(0.9).with_max_tokens(12);
    let (a, _dir_a) = loaded_session(ModelManifest::default(), 256);
    let (b, _dir_b) = loaded_session(ModelManifest::default(), 256);

    let out_a = a.generate("Once upon", &overrides).unwrap();
    let out_b = b.generate("Once upon", &overrides).unwrap();
    assert_eq!(out_a.tokens, out_b.tokens);
}

#[test]
fn different_prompts_diverge() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 256);
    let a = session.generate("alpha", &greedy(8)).unwrap();
    let b = session.generate("omega", &greedy(8)).unwrap();
    assert_ne!(a.tokens, b.tokens);
}

#[test]
fn text_is_detokenized_output() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 256);
    let out = session.generate("Hello", &greedy(6)).unwrap();
    assert_eq!(session.detokenize(&out.tokens).unwrap(), out.text);
    assert_eq!(out.prompt_tokens, 6);
}

// ===========================================================================
// Prompt length
// ===========================================================================

#[test]
fn prompt_over_limit_never_decodes() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 16);
    let limit = 16 - PROMPT_MARGIN;

    // 12 bytes + BOS = 13 tokens
    let err = session.generate("abcdefghijkl", &greedy(4)).unwrap_err();
    match err {
        GenerateError::PromptTooLong { tokens, limit: l } => {
            assert_eq!(tokens, 13);
            assert_eq!(l, limit);
        }
        other => panic!("expected PromptTooLong, got {other:?}"),
    }
    assert_eq!(session.engine().decode_calls(), 0);
    assert!(!session.is_generating());
}

#[test]
fn prompt_at_limit_is_accepted() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 16);
    // 11 bytes + BOS = 12 tokens
    let out = session.generate("abcdefghijk", &greedy(2)).unwrap();
    assert_eq!(out.prompt_tokens, 12);
    assert_eq!(out.tokens.len(), 2);
}

#[test]
fn context_size_override_narrows_the_window() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 256);
    let overrides = ParamOverrides {
        context_size: Some(8),
        ..greedy(2)
    };
    let err = session.generate("Hello", &overrides).unwrap_err();
    assert!(matches!(err, GenerateError::PromptTooLong { tokens: 6, limit: 4 }));
}

// ===========================================================================
// Stop conditions
// ===========================================================================

#[test]
fn end_of_sequence_stops_and_is_excluded() {
    // "Hi" + BOS = 3 prompt positions; EOS wins once 6 positions are cached.
    let manifest = ModelManifest {
        eos_at: Some(6),
        ..ModelManifest::default()
    };
    let (session, _dir) = loaded_session(manifest, 128);

    let out = session.generate("Hi", &greedy(50)).unwrap();
    assert_eq!(out.stop_reason, StopReason::StopToken);
    assert_eq!(out.tokens.len(), 3);
    assert!(!out.tokens.contains(&EOS_ID));
}

#[test]
fn end_of_sequence_stops_stochastic_sampling_too() {
    let manifest = ModelManifest {
        eos_at: Some(4),
        ..ModelManifest::default()
    };
    let (session, _dir) = loaded_session(manifest, 128);

    let out = session
        .generate("Hi", &ParamOverrides::default().with_temperature(1.0).with_max_tokens(50))
        .unwrap();
    assert_eq!(out.stop_reason, StopReason::StopToken);
    assert_eq!(out.tokens.len(), 1);
}

#[test]
fn full_context_stops_generation() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 16);

    let out = session.generate("Hi", &greedy(100)).unwrap();
    assert_eq!(out.stop_reason, StopReason::ContextLength);
    // Positions 3..16 are stepped, plus the final sampled token.
    assert_eq!(out.tokens.len(), 16 - 3 + 1);
}

#[test]
fn decode_failure_returns_partial_output() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    // Call 1 is the prefill, call 2 the first step, call 3 fails.
    session.engine().set_fail_decode_at(Some(3));

    let out = session.generate("Hello", &greedy(20)).unwrap();
    assert_eq!(out.stop_reason, StopReason::DecodeFailed);
    assert_eq!(out.tokens.len(), 2);
    assert_eq!(out.metrics.step_decodes, 1);
    assert_eq!(out.metrics.stop_reason, StopReason::DecodeFailed);
    assert!(!session.is_generating());

    // The session is still usable.
    let again = session.generate("Hello", &greedy(2)).unwrap();
    assert_eq!(again.stop_reason, StopReason::MaxTokens);
    assert_eq!(again.tokens, out.tokens);
}

#[test]
fn prefill_failure_is_an_error() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    session.engine().set_fail_decode_at(Some(1));

    let err = session.generate("Hello", &greedy(4)).unwrap_err();
    assert!(matches!(err, GenerateError::Prefill(_)));
    assert!(!session.is_generating());
}

#[test]
fn generate_requires_a_model() {
    let session = Session::new(ReferenceEngine::new());
    assert!(matches!(
        session.generate("Hello", &greedy(4)),
        Err(GenerateError::NotLoaded)
    ));
    assert!(!session.is_generating());
}

// ===========================================================================
// Parameters
// ===========================================================================

#[test]
fn sentinel_overrides_fall_back_to_defaults() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    session.set_default_params(&ParamOverrides::greedy().with_max_tokens(3));

    let out = session
        .generate("Hello", &ParamOverrides::from_raw(0, -1.0, 0.0, 0, 0.0))
        .unwrap();
    assert_eq!(out.tokens.len(), 3);

    let explicit = session.generate("Hello", &greedy(3)).unwrap();
    assert_eq!(out.tokens, explicit.tokens);
}

#[test]
fn sentinels_set_directly_fall_back_to_defaults() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    session.set_default_params(&ParamOverrides::greedy().with_max_tokens(5));
    let expected = session.generate("Hello", &ParamOverrides::default()).unwrap();
    assert_eq!(expected.tokens.len(), 5);

    let negative_temperature = session
        .generate("Hello", &ParamOverrides::default().with_temperature(-1.0))
        .unwrap();
    assert_eq!(negative_temperature.stop_reason, StopReason::MaxTokens);
    assert_eq!(negative_temperature.tokens, expected.tokens);

    let zero_max = session.generate("Hello", &ParamOverrides::greedy().with_max_tokens(0)).unwrap();
    assert_eq!(zero_max.tokens, expected.tokens);

    let zeros = ParamOverrides {
        top_k: Some(0),
        top_p: Some(0.0),
        repeat_penalty: Some(0.0),
        thread_count: Some(0),
        context_size: Some(0),
        ..ParamOverrides::default()
    };
    let out = session.generate("Hello", &zeros).unwrap();
    assert_eq!(out.tokens, expected.tokens);
    assert_eq!(session.default_params().thread_count, 2);
}

#[test]
fn thread_override_is_per_call() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    let overrides = ParamOverrides {
        thread_count: Some(16),
        ..greedy(2)
    };
    session.generate("Hello", &overrides).unwrap();
    assert_eq!(session.default_params().thread_count, 2);
}

#[test]
fn config_defaults_apply_without_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let mut config = SessionConfig::default().with_seed(1);
    config.defaults.max_tokens = 4;
    config.defaults.temperature = 0.0;

    let session = Session::with_config(ReferenceEngine::new(), config);
    session.load(&path, None, None).unwrap();

    let out = session.generate("Hello", &ParamOverrides::default()).unwrap();
    assert_eq!(out.tokens.len(), 4);
    assert_eq!(session.context_size(), 2048);
}

// ===========================================================================
// Streaming and metrics
// ===========================================================================

#[test]
fn streamed_text_matches_result() {
    let manifest = ModelManifest {
        pieces: vec!["é".into(), "日本".into(), " the".into()],
        ..ModelManifest::default()
    };
    let (session, _dir) = loaded_session(manifest, 256);

    let mut streamed = String::new();
    let out = session
        .generate_with("Hello", &greedy(24), &Default::default(), |piece| streamed.push_str(piece))
        .unwrap();
    assert_eq!(streamed, out.text);
}

#[test]
fn metrics_describe_the_run() {
    let log = Arc::new(LogTelemetry::new());
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let session = Session::new(ReferenceEngine::new()).with_telemetry(log.clone());
    session.load(&path, Some(128), None).unwrap();

    let out = session.generate("Hello", &greedy(7)).unwrap();
    assert_eq!(out.metrics.generated_tokens, 7);
    assert_eq!(out.metrics.prompt_tokens, 6);
    // The last token is never fed back.
    assert_eq!(out.metrics.step_decodes, 6);
    assert_eq!(out.metrics.stop_reason, StopReason::MaxTokens);
    assert!(out.metrics.total_time_ms >= out.metrics.ttft_ms);

    let reported = log.last_metrics().unwrap();
    assert_eq!(reported, out.metrics);
    assert_eq!(log.runs(), 1);
    assert_eq!(log.interrupted_runs(), 0);
}

#[test]
fn sessions_generate_concurrently_when_shared() {
    let (session, _dir) = session_with(ReferenceEngine::new(), ModelManifest::default(), 256);
    let session = Arc::new(session);
    let results = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let session = Arc::clone(&session);
            let results = Arc::clone(&results);
            std::thread::spawn(move || {
                let out = session.generate("Hello", &greedy(5)).unwrap();
                results.lock().unwrap().push(out.tokens);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|t| t == &results[0]));
}
