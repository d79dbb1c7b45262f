//! Loading relay configuration files through Figment.

use irq_relay::config::RelayConfig;
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_bundled_config_is_valid() {
    let config = RelayConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/relay.toml"))
        .unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.application.name, "gih");
    assert_eq!(config.pipeline.chunk_size, 512);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let file = write_config(
        r#"
        [pipeline]
        irq_id = 4
        destination = "/tmp/relay.bin"
        "#,
    );

    let config = RelayConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_ok());

    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.pipeline.delay_ms, 0);
    assert_eq!(config.pipeline.chunk_size, relay_core::DEFAULT_CHUNK_SIZE);
    assert!(!config.pipeline.keep_missed);
    assert_eq!(config.device.log_capacity, relay_core::DEFAULT_LOG_CAPACITY);
    assert_eq!(config.trigger_period(), Duration::from_millis(100));
    assert_eq!(config.device_options().shutdown_timeout, Duration::from_secs(5));
}

#[test]
fn test_missing_pipeline_section_fails_to_load() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"
        "#,
    );
    assert!(RelayConfig::load_from(file.path()).is_err());
}

#[test]
fn test_out_of_range_values_fail_validation() {
    let file = write_config(
        r#"
        [pipeline]
        irq_id = 1
        destination = "/tmp/relay.bin"
        delay_ms = 120000
        "#,
    );

    let config = RelayConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("delay_ms"));
}

#[test]
fn test_append_mode_maps_to_opener() {
    let file = write_config(
        r#"
        [pipeline]
        irq_id = 1
        destination = "/tmp/relay.bin"
        append = true
        "#,
    );

    let config = RelayConfig::load_from(file.path()).unwrap();
    assert!(config.pipeline.append);
    assert!(config.validate().is_ok());
}
