//! Configuration file tests
//!
//! Run with: `cargo test -p driver --test config_tests`

use driver::config::{DriverConfig, load_config};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let mut config = DriverConfig::default();
    config.driver.log_level = "debug".to_string();
    config.usb.extra_devices = vec!["0x2357:0x0101".to_string()];
    config.buffers.rx_buffers = 16;
    config.save(&path).unwrap();

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.driver.log_level, "debug");
    assert_eq!(loaded.usb.extra_devices, vec!["0x2357:0x0101".to_string()]);
    assert_eq!(loaded.buffers.rx_buffers, 16);
}

#[test]
fn test_load_minimal_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(
        &path,
        r#"
[usb]
configuration = 2

[buffers]
drain_timeout_ms = 300
"#,
    )
    .unwrap();

    let config = DriverConfig::load(Some(path)).unwrap();
    let settings = config.driver_settings().unwrap();
    assert_eq!(settings.configuration, 2);
    assert_eq!(settings.interface, 0);
    assert_eq!(settings.rx_buffers, 8);
    assert_eq!(settings.drain_timeout, Duration::from_millis(300));
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(
        &path,
        r#"
[usb]
extra_devices = ["0x0bda-0x8812"]
"#,
    )
    .unwrap();

    assert!(DriverConfig::load(Some(path)).is_err());
}

#[test]
fn test_load_rejects_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    fs::write(&path, "[buffers\nrx_buffers = ").unwrap();

    assert!(DriverConfig::load(Some(path)).is_err());
}

#[test]
fn test_load_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_load_config_accepts_plain_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    DriverConfig::default().save(&path).unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.buffers.buffer_size, 2048);
}
