//! Integration tests for building an engine from a configuration file.

#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::Arc;

use common::Harness;
use warrant_config::Config;
use warrant_core::{KeyId, KeyKind, KeyMask};
use warrant_engine::{Engine, EngineError, Violation};
use warrant_telemetry::{LogConfig, LogFormat, setup_test_logging};
use warrant_test::{MockKeyInfoProvider, key_info};

const POLICY_TOML: &str = r#"
[policy]
revision = 3
minimum_mask = 4
recommended_mask = 12
recommended_kind = "Character"
required_password_strength = 2
login_history_days = 7

[logging]
level = "debug"
format = "json"

[provider]
max_retries = 0
initial_backoff_ms = 1
max_backoff_ms = 1
"#;

fn load_config() -> Config {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, POLICY_TOML).unwrap();
    Config::load_file(&path).unwrap()
}

#[test]
fn test_policy_from_file_is_enforced() {
    setup_test_logging();
    let config = load_config();
    let h = Harness::with_config(&config);
    assert_eq!(h.engine.policy().revision(), 3);

    assert!(matches!(
        h.engine.create_user("weak", 1),
        Err(EngineError::WeakPassword { score: 1, required: 2 })
    ));
    let user = h.engine.create_user("strong", 2).unwrap().id;

    assert!(matches!(
        h.engine
            .register_credential(user, KeyId(1), "c", KeyMask(2), KeyKind::Character),
        Err(EngineError::InvalidMask { minimum: KeyMask(4), .. })
    ));
    assert!(
        h.engine
            .register_credential(user, KeyId(1), "c", KeyMask(12), KeyKind::Character)
            .is_ok()
    );
}

#[tokio::test]
async fn test_keys_below_recommendation_are_not_verified() {
    let config = load_config();
    let provider = MockKeyInfoProvider::new()
        .with_key(KeyId(5), key_info(4, KeyKind::Character, &[(50, "Minimal")]))
        .with_key(KeyId(6), key_info(12, KeyKind::Corporation, &[(60, "Corp")]));
    let engine = Engine::new(&config, Arc::new(provider)).unwrap();
    let user = engine.create_user("verifier", 4).unwrap().id;

    let (minimal, _) = engine.add_key(user, KeyId(5), "c").await.unwrap();
    assert!(!minimal.verified);
    assert_eq!(minimal.violation, Some(Violation::Mask));

    let (corp, _) = engine.add_key(user, KeyId(6), "c").await.unwrap();
    assert!(!corp.verified);
    assert_eq!(corp.violation, Some(Violation::Kind));
}

#[test]
fn test_logging_section_maps_to_log_config() {
    let config = load_config();
    let log = LogConfig::from(&config.logging);
    assert_eq!(log.level, "debug");
    assert_eq!(log.format, LogFormat::Json);
    assert!(!log.ansi);
}
