//! Settings file round-trips.

use std::time::Duration;

use scopekit_settings::{EngineSettings, SettingsError};
use tempfile::TempDir;

fn customized() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.bus.enable_history = true;
    settings.bus.max_history_size = 50;
    settings.acquisition.progress_interval_ms = 100;
    settings.acquisition.pause_enabled = false;
    settings.live.default_fps = 5.0;
    settings.logging.directive = "scopekit=debug".to_string();
    settings
}

#[test]
fn toml_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("settings.toml");

    let settings = customized();
    settings.save_to_file(&path).unwrap();
    let loaded = EngineSettings::load_from_file(&path).unwrap();
    assert_eq!(loaded, settings);
    assert_eq!(
        loaded.acquisition_timing().progress_interval,
        Duration::from_millis(100)
    );
    assert!(loaded.bus_config().enable_history);
}

#[test]
fn json_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let settings = customized();
    settings.save_to_file(&path).unwrap();
    let loaded = EngineSettings::load_from_file(&path).unwrap();
    assert_eq!(loaded, settings);
}

#[test]
fn invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "[live]\ndefault_fps = -3.0\n").unwrap();

    let err = EngineSettings::load_from_file(&path).unwrap_err();
    assert!(matches!(err, SettingsError::InvalidSetting { .. }));

    std::fs::write(&path, "[live\n").unwrap();
    let err = EngineSettings::load_from_file(&path).unwrap_err();
    assert!(matches!(err, SettingsError::TomlError(_)));
}

#[test]
fn invalid_settings_are_not_saved() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.toml");

    let mut settings = EngineSettings::default();
    settings.logging.directive = "  ".to_string();
    assert!(settings.save_to_file(&path).is_err());
    assert!(!path.exists());
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let loaded = EngineSettings::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(loaded, EngineSettings::default());
}
