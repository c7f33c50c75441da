//! Configuration loading and validation tests.
//!
//! Tests TOML parsing, environment variable overrides and the shipped example file.

use std::env;

use eslog_core::config::EslogConfig;
use serial_test::serial;

#[test]
fn test_example_config_parses_and_validates() {
    // Given: The example config shipped with the repository
    let toml_str = include_str!("../../eslog.toml.example");

    // When: Parsing and validating it
    let config = EslogConfig::parse(toml_str).expect("example config should parse");

    // Then: It is valid and matches the documented defaults
    config.validate().expect("example config should validate");
    assert_eq!(config.plugin.socket_path, "/run/docker/plugins/elasticsearch.sock");
    assert_eq!(config.plugin.shutdown_timeout_secs, 30);
    assert_eq!(config.pipeline.retryable_statuses, vec![429]);
    assert!(!config.metrics.enabled);
}

#[test]
fn test_partial_config_uses_defaults() {
    // Given: Only the plugin section
    let toml_str = r#"
[plugin]
socket_path = "/tmp/es.sock"
"#;

    // When: Parsing config
    let config = EslogConfig::parse(toml_str).expect("partial config should parse");

    // Then: Missing sections use defaults
    assert_eq!(config.plugin.socket_path, "/tmp/es.sock");
    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[general]\nlog_level = \"loud\"",
        "[general]\nlog_format = \"xml\"",
        "[pipeline]\nchannel_capacity = 0",
        "[pipeline]\nretryable_statuses = [42]",
    ];
    for toml_str in cases {
        let config = EslogConfig::parse(toml_str).expect("should parse");
        assert!(config.validate().is_err(), "should reject: {toml_str}");
    }
}

#[test]
fn test_malformed_toml_fails() {
    assert!(EslogConfig::parse("[plugin\nsocket_path = ").is_err());
}

#[tokio::test]
#[serial]
async fn test_env_override_applies_after_file() {
    // Given: A config file and an environment override
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eslog.toml");
    let config = EslogConfig::parse("[general]\nlog_level = \"warn\"").unwrap();
    std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

    // SAFETY: Test isolation - serialized and cleaned up below
    unsafe {
        env::set_var("ESLOG_GENERAL_LOG_LEVEL", "debug");
    }

    // When: Loading the file
    let loaded = EslogConfig::load(&path).await;

    // SAFETY: Test cleanup
    unsafe {
        env::remove_var("ESLOG_GENERAL_LOG_LEVEL");
    }

    // Then: The environment wins
    assert_eq!(loaded.unwrap().general.log_level, "debug");
}

#[tokio::test]
#[serial]
async fn test_load_or_default_without_file() {
    let config = EslogConfig::load_or_default("/nonexistent/eslog.toml")
        .await
        .expect("missing file should fall back to defaults");
    assert_eq!(config.metrics.port, 9100);
}
