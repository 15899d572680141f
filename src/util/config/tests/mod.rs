//! Config tests

use std::io::Write;
use std::time::Duration;

use super::*;

#[test]
fn test_defaults_when_empty() {
    let config = FlowConfig::from_toml_str("").unwrap();
    assert_eq!(config, FlowConfig::default());
    assert_eq!(config.queue_capacity, 16);
    assert!(config.workers >= 1);
    assert_eq!(config.timeout(), None);
    assert_eq!(config.log_level, LogLevel::Info);
}

#[test]
fn test_parse_all_keys() {
    let config = FlowConfig::from_toml_str(
        r#"
queue_capacity = 32
workers = 3
timeout_ms = 1500
log_level = "debug"
"#,
    )
    .unwrap();

    assert_eq!(config.queue_capacity, 32);
    assert_eq!(config.workers, 3);
    assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(config.log_level, LogLevel::Debug);
}

#[test]
fn test_zero_values_rejected() {
    let err = FlowConfig::from_toml_str("queue_capacity = 0").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid(FlowError::InvalidCapacity(0))
    ));

    let err = FlowConfig::from_toml_str("workers = 0").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid(FlowError::InvalidWorkerCount(0))
    ));
}

#[test]
fn test_bad_toml_is_parse_error() {
    let err = FlowConfig::from_toml_str("workers = \"many\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = FlowConfig::from_toml_str("log_level = \"loud\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "workers = 5").unwrap();
    writeln!(file, "timeout_ms = 250").unwrap();

    let config = FlowConfig::load(file.path()).unwrap();
    assert_eq!(config.workers, 5);
    assert_eq!(config.timeout_ms, Some(250));
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = FlowConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_written_config_loads_back() {
    let config = FlowConfig {
        queue_capacity: 8,
        workers: 2,
        timeout_ms: Some(100),
        log_level: LogLevel::Warn,
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowq.toml");
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    assert_eq!(FlowConfig::load(&path).unwrap(), config);
}
