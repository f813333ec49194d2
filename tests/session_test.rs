//! Session lifecycle tests.
//!
//! Validates:
//! - load / unload / is_loaded and the size and description queries
//! - unload-before-load replaces the live pair
//! - failed loads roll back to nothing loaded (context failure frees the model)
//! - effective context size and thread count become the defaults after load
//! - zero or negative parameter updates leave the defaults alone
//! - out-of-range context sizes fail the load without leaking a model
//! - token utilities report NotLoaded without a model
//! - shutdown frees the backend exactly once

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{loaded_session, write_model};
use llama_bridge::session::NO_MODEL;
use llama_bridge::{LoadError, ParamOverrides, Session, SessionConfig, TokenizerError};
use llama_runtime::reference::BOS_ID;
use llama_runtime::{ModelManifest, ReferenceEngine};

#[test]
fn fresh_session_has_nothing_loaded() {
    let session = Session::new(ReferenceEngine::new());
    assert!(!session.is_loaded());
    assert_eq!(session.context_size(), 0);
    assert_eq!(session.vocab_size(), 0);
    assert_eq!(session.embedding_size(), 0);
    assert_eq!(session.model_description(), NO_MODEL);
    assert!(!session.is_generating());
}

#[test]
fn load_then_unload() {
    let manifest = ModelManifest {
        description: "tiny test model".into(),
        pieces: vec!["Hello".into()],
        n_embd: 16,
        ..ModelManifest::default()
    };
    let (session, _dir) = loaded_session(manifest, 256);

    assert!(session.is_loaded());
    assert_eq!(session.context_size(), 256);
    assert_eq!(session.vocab_size(), 259);
    assert_eq!(session.embedding_size(), 16);
    assert_eq!(session.model_description(), "tiny test model");
    assert_eq!(session.engine().live_models(), 1);
    assert_eq!(session.engine().live_contexts(), 1);

    session.unload();
    assert!(!session.is_loaded());
    assert_eq!(session.engine().live_models(), 0);
    assert_eq!(session.engine().live_contexts(), 0);
    assert_eq!(session.model_description(), NO_MODEL);

    // Unloading twice is harmless.
    session.unload();
    assert!(!session.is_loaded());
}

#[test]
fn loading_again_replaces_the_pair() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let session = Session::new(ReferenceEngine::new());

    session.load(&path, Some(128), None).unwrap();
    session.load(&path, Some(64), None).unwrap();

    assert_eq!(session.engine().live_models(), 1);
    assert_eq!(session.engine().live_contexts(), 1);
    assert_eq!(session.context_size(), 64);
    assert_eq!(session.engine().backend_inits(), 1);
}

#[test]
fn missing_file_leaves_nothing_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let session = Session::new(ReferenceEngine::new());
    session.load(&path, None, None).unwrap();

    let err = session.load(Path::new("/nonexistent/model.gguf"), None, None).unwrap_err();
    assert!(matches!(err, LoadError::Model { .. }));
    assert!(err.to_string().contains("/nonexistent/model.gguf"));

    // The previous pair was torn down before the failed attempt.
    assert!(!session.is_loaded());
    assert_eq!(session.engine().live_models(), 0);
}

#[test]
fn incompatible_file_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.gguf");
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00").unwrap();

    let session = Session::new(ReferenceEngine::new());
    assert!(matches!(session.load(&path, None, None), Err(LoadError::Model { .. })));
    assert!(!session.is_loaded());
}

#[test]
fn context_failure_frees_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let engine = ReferenceEngine::new();
    engine.set_fail_context(true);
    let session = Session::new(engine);

    let err = session.load(&path, None, None).unwrap_err();
    assert!(matches!(err, LoadError::Context(_)));
    assert!(!session.is_loaded());
    assert_eq!(session.engine().live_models(), 0);
    assert_eq!(session.engine().live_contexts(), 0);

    session.engine().set_fail_context(false);
    session.load(&path, None, None).unwrap();
    assert!(session.is_loaded());
}

#[test]
fn load_updates_default_context_and_threads() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 512);
    let defaults = session.default_params();
    assert_eq!(defaults.context_size, 512);
    assert_eq!(defaults.thread_count, 2);
    assert_eq!(defaults.max_tokens, 512);
}

#[test]
fn zero_context_uses_model_training_size() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = ModelManifest {
        n_ctx_train: 1000,
        ..ModelManifest::default()
    };
    let path = write_model(&dir, &manifest);
    let mut config = SessionConfig::default();
    config.defaults.context_size = 0;
    let session = Session::with_config(ReferenceEngine::new(), config);

    session.load(&path, None, None).unwrap();
    assert_eq!(session.context_size(), 1000);
    assert_eq!(session.default_params().context_size, 1000);
}

#[test]
fn parameter_updates() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);

    session.set_thread_count(8);
    assert_eq!(session.default_params().thread_count, 8);
    session.set_thread_count(0);
    assert_eq!(session.default_params().thread_count, 8);

    session.set_default_params(&ParamOverrides::from_raw(32, 0.2, -1.0, 5, 0.0));
    let p = session.default_params();
    assert_eq!(p.max_tokens, 32);
    assert_eq!(p.temperature, 0.2);
    assert_eq!(p.top_p, 0.9);
    assert_eq!(p.top_k, 5);
    assert_eq!(p.repeat_penalty, 1.1);
}

#[test]
fn zero_overrides_keep_the_defaults() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 128);
    let before = session.default_params();

    session.set_default_params(&ParamOverrides {
        max_tokens: Some(0),
        temperature: Some(-1.0),
        top_p: Some(0.0),
        top_k: Some(0),
        repeat_penalty: Some(-1.0),
        thread_count: Some(0),
        context_size: Some(0),
    });
    assert_eq!(session.default_params(), before);
    assert_eq!(session.default_params().thread_count, 2);
    assert_eq!(session.context_size(), 128);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn oversized_context_is_rejected_before_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let session = Session::new(ReferenceEngine::new());

    let err = session.load(&path, Some(u32::MAX as usize + 1), None).unwrap_err();
    assert!(matches!(err, LoadError::Context(_)));
    assert!(!session.is_loaded());
    assert_eq!(session.engine().live_models(), 0);
    assert_eq!(session.engine().live_contexts(), 0);
}

#[test]
fn huge_thread_count_is_clamped() {
    let (session, _dir) = loaded_session(ModelManifest::default(), 64);
    session.set_thread_count(usize::MAX);
    assert_eq!(session.default_params().thread_count, usize::MAX);
    assert!(session.generate("Hi", &ParamOverrides::greedy().with_max_tokens(2)).is_ok());
}

#[test]
fn token_utilities_roundtrip() {
    let manifest = ModelManifest {
        pieces: vec![" world".into()],
        ..ModelManifest::default()
    };
    let (session, _dir) = loaded_session(manifest, 128);

    let tokens = session.tokenize("Hi world", false).unwrap();
    assert_eq!(tokens.len(), 3);
    assert_eq!(session.detokenize(&tokens).unwrap(), "Hi world");

    let with_bos = session.tokenize("Hi", true).unwrap();
    assert_eq!(with_bos[0], BOS_ID);
    assert!(session.tokenize("", false).unwrap().is_empty());
}

#[test]
fn token_utilities_require_a_model() {
    let session = Session::new(ReferenceEngine::new());
    assert_eq!(session.tokenize("x", true), Err(TokenizerError::NotLoaded));
    assert_eq!(session.detokenize(&[1, 2]), Err(TokenizerError::NotLoaded));
}

#[test]
fn shutdown_frees_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let engine = Arc::new(ReferenceEngine::new());
    let session = Session::new(Arc::clone(&engine));

    session.load(&path, None, None).unwrap();
    session.load(&path, None, None).unwrap();
    assert_eq!(engine.backend_inits(), 1);

    session.shutdown();
    assert_eq!(engine.backend_frees(), 1);
    assert_eq!(engine.live_models(), 0);
    assert_eq!(engine.live_contexts(), 0);
}

#[test]
fn shutdown_without_load_skips_backend_free() {
    let engine = Arc::new(ReferenceEngine::new());
    Session::new(Arc::clone(&engine)).shutdown();
    assert_eq!(engine.backend_frees(), 0);
}

#[test]
fn drop_releases_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &ModelManifest::default());
    let engine = Arc::new(ReferenceEngine::new());

    let session = Session::new(Arc::clone(&engine));
    session.load(&path, None, None).unwrap();
    drop(session);

    assert_eq!(engine.live_models(), 0);
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.backend_frees(), 0);
}

#[test]
fn available_memory_is_reported_or_zero() {
    let session = Session::new(ReferenceEngine::new());
    let bytes = session.available_memory();
    if cfg!(target_os = "linux") && Path::new("/proc/meminfo").exists() {
        assert!(bytes > 0);
    }
}

#[test]
fn session_ids_are_unique() {
    let a = Session::new(ReferenceEngine::new());
    let b = Session::new(ReferenceEngine::new());
    assert_ne!(a.id(), b.id());
}
