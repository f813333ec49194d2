//! Tests for session configuration.

use std::io::Write;

use llama_bridge::{ConfigError, GenerationParams, ParamOverrides, SessionConfig};

#[test]
fn test_defaults() {
    let config = SessionConfig::default();
    assert_eq!(config.defaults.max_tokens, 512);
    assert_eq!(config.defaults.temperature, 0.7);
    assert_eq!(config.defaults.top_p, 0.9);
    assert_eq!(config.defaults.top_k, 40);
    assert_eq!(config.defaults.repeat_penalty, 1.1);
    assert_eq!(config.defaults.thread_count, 4);
    assert_eq!(config.defaults.context_size, 2048);
    assert_eq!(config.repeat_last_n, 64);
    assert!(config.use_mmap);
    assert!(!config.use_mlock);
    assert!(config.seed.is_none());
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "defaults": { "max_tokens": 64, "temperature": 0.0 },
        "seed": 1234,
        "use_mlock": true
    }"#;

    let config = SessionConfig::from_json(json).unwrap();
    assert_eq!(config.defaults.max_tokens, 64);
    assert_eq!(config.defaults.temperature, 0.0);
    // Unspecified fields keep their defaults.
    assert_eq!(config.defaults.top_k, 40);
    assert_eq!(config.defaults.context_size, 2048);
    assert_eq!(config.seed, Some(1234));
    assert!(config.use_mmap);
    assert!(config.use_mlock);
}

#[test]
fn test_empty_json_is_default() {
    assert_eq!(SessionConfig::from_json("{}").unwrap(), SessionConfig::default());
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "repeat_last_n": 16, "defaults": {{ "thread_count": 8 }} }}"#).unwrap();

    let config = SessionConfig::from_file(file.path()).unwrap();
    assert_eq!(config.repeat_last_n, 16);
    assert_eq!(config.defaults.thread_count, 8);
}

#[test]
fn test_config_errors() {
    assert!(matches!(SessionConfig::from_json("{ not json"), Err(ConfigError::Json(_))));
    assert!(matches!(
        SessionConfig::from_file(std::path::Path::new("/nonexistent/config.json")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_overrides_from_json() {
    let overrides: ParamOverrides = serde_json::from_str(r#"{ "top_k": 5 }"#).unwrap();
    let resolved = GenerationParams::default().resolve(&overrides);
    assert_eq!(resolved.top_k, 5);
    assert_eq!(resolved.top_p, 0.9);
}

#[test]
fn test_params_roundtrip_through_json() {
    let params = GenerationParams {
        max_tokens: 5,
        temperature: 0.0,
        ..GenerationParams::default()
    };
    let json = serde_json::to_string(&params).unwrap();
    let back: GenerationParams = serde_json::from_str(&json).unwrap();
    assert_eq!(back, params);
}
