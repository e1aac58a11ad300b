//! Tests for loading configuration from a TOML file plus environment.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use residency_core::config::{self, ConfigError};
use residency_core::telemetry::LogFormat;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: &[&str] = &[
    "RESIDENCY_CONFIG",
    "RESIDENCY_ENABLED",
    "RESIDENCY_BUDGET_MB",
    "RESIDENCY_WAIT_TIMEOUT_SECS",
    "RESIDENCY_DEFAULT_ESTIMATE_MB",
    "RESIDENCY_PRELOAD",
    "RESIDENCY_ESTIMATES",
    "RESIDENCY_SHUTDOWN_TIMEOUT_SECS",
    "RESIDENCY_LOG_FORMAT",
    "RESIDENCY_LOG_LEVEL",
];

fn clear_env() {
    for k in ENV_KEYS {
        std::env::remove_var(k);
    }
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_file_named_by_env_is_loaded() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let file = write_config(
        r#"
        budget_mb = 24000
        wait_timeout_secs = 10
        preload = ["ocr"]
        log_format = "pretty"

        [estimates]
        ocr = 4700
        "#,
    );
    std::env::set_var("RESIDENCY_CONFIG", file.path());

    let cfg = config::load().unwrap();
    assert_eq!(cfg.coordinator.budget_mb, 24_000);
    assert_eq!(cfg.coordinator.default_timeout, Duration::from_secs(10));
    assert_eq!(cfg.coordinator.preload, vec!["ocr"]);
    assert_eq!(cfg.coordinator.estimates["ocr"], 4700);
    assert_eq!(cfg.log.format, LogFormat::Pretty);
    clear_env();
}

#[test]
fn test_env_overrides_file() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let file = write_config("budget_mb = 24000\n[estimates]\nocr = 4700\n");
    std::env::set_var("RESIDENCY_BUDGET_MB", "8000");
    std::env::set_var("RESIDENCY_ESTIMATES", "chat=6000");

    let cfg = config::load_with_file(file.path()).unwrap();
    assert_eq!(cfg.coordinator.budget_mb, 8000);
    assert_eq!(cfg.coordinator.estimates["ocr"], 4700);
    assert_eq!(cfg.coordinator.estimates["chat"], 6000);

    let effective = cfg.effective_config();
    assert_eq!(
        effective.estimates,
        vec![("chat".to_string(), 6000), ("ocr".to_string(), 4700)]
    );
    clear_env();
}

#[test]
fn test_malformed_file_is_an_error() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let file = write_config("budget_mb = \"lots\"");
    let err = config::load_with_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let missing = file.path().with_extension("missing");
    let err = config::load_with_file(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_zero_budget_is_floored() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    let file = write_config("budget_mb = 0\nshutdown_timeout_secs = 0\n");
    let cfg = config::load_with_file(file.path()).unwrap();
    assert_eq!(cfg.coordinator.budget_mb, 1);
    assert_eq!(cfg.coordinator.shutdown_timeout, Duration::from_secs(1));
}
