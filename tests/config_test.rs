//! Configuration loading through the figment provider stack.
//!
//! Only `env_overrides_file` touches the environment, and it overrides a
//! field no other test here inspects.

use spectro_scan::config::{AcquisitionMode, LogFormat, ScanConfig};
use spectro_scan::ScanError;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn shipped_config_loads_and_validates() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/scan.toml");
    let config = ScanConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.network.max_retries, 3);
    assert_eq!(config.timing.window(), Duration::from_secs(3));
    assert_eq!(config.acquisition.controller_mode, AcquisitionMode::Interval);
}

#[test]
fn omitted_sections_take_defaults() {
    let file = toml_file(
        r#"
        [application]
        name = "bench"
        log_level = "debug"
        log_format = "json"

        [network]
        max_retries = 5
        "#,
    );
    let config = ScanConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.network.max_retries, 5);
    assert_eq!(config.network.reply_timeout(), Duration::from_millis(500));
    assert_eq!(config.timing.trigger_lead(), Duration::from_millis(120));
    assert_eq!(config.thresholds.stability().intensity_stddev, 0.05);
    assert_eq!(config.ledger.path, PathBuf::from("failed_steps.jsonl"));
}

#[test]
fn env_overrides_file() {
    let file = toml_file(
        r#"
        [application]
        name = "bench"
        log_level = "info"

        [timing]
        settle_ms = 250
        "#,
    );
    std::env::set_var("SPECTRO_SCAN__TIMING__SETTLE_MS", "42");
    let config = ScanConfig::load_from(file.path());
    std::env::remove_var("SPECTRO_SCAN__TIMING__SETTLE_MS");

    assert_eq!(config.unwrap().timing.settle(), Duration::from_millis(42));
}

#[test]
fn unknown_acquisition_mode_is_a_load_error() {
    let file = toml_file(
        r#"
        [application]
        name = "bench"
        log_level = "info"

        [acquisition]
        analyzer_mode = "burst"
        "#,
    );
    assert!(matches!(
        ScanConfig::load_from(file.path()),
        Err(ScanError::Config(_))
    ));
}

#[test]
fn loaded_values_are_validated() {
    let file = toml_file(
        r#"
        [application]
        name = "bench"
        log_level = "info"

        [timing]
        trigger_lead_ms = 400
        "#,
    );
    let config = ScanConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("timing.trigger_lead_ms"));
}
