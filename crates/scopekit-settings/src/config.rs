//! Engine settings
//!
//! Settings are organized into sections:
//! - Event bus (history, broadcast capacity)
//! - Acquisition timing and pause policy
//! - Live view frame rates
//! - Logging
//!
//! Files may be TOML or JSON; the format follows the extension. Missing
//! sections and fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use scopekit_acquisition::{AcquisitionTiming, LiveSettings};
use scopekit_core::EventBusConfig;

use crate::error::{SettingsError, SettingsResult};

/// File name used under the platform config directory
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Keep a history of dispatched events
    pub enable_history: bool,
    /// Maximum number of events kept in history
    pub max_history_size: usize,
    /// How long history entries are kept, in seconds
    pub history_retention_s: u64,
    /// Capacity of the async broadcast channel
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        let defaults = EventBusConfig::default();
        Self {
            enable_history: defaults.enable_history,
            max_history_size: defaults.max_history_size,
            history_retention_s: defaults.history_retention.as_secs(),
            channel_capacity: defaults.channel_capacity,
        }
    }
}

/// Acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Minimum spacing between progress reports, milliseconds
    pub progress_interval_ms: u64,
    /// Poll interval while paused, milliseconds
    pub pause_poll_ms: u64,
    /// Accept pause and resume commands
    pub pause_enabled: bool,
    /// Extra wait after every XY move, milliseconds
    pub stage_settle_ms: u64,
    /// Longest uninterrupted sleep while waiting for a time point, milliseconds
    pub wait_slice_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        let timing = AcquisitionTiming::default();
        Self {
            progress_interval_ms: timing.progress_interval.as_millis() as u64,
            pause_poll_ms: timing.pause_poll.as_millis() as u64,
            pause_enabled: true,
            stage_settle_ms: timing.stage_settle.as_millis() as u64,
            wait_slice_ms: timing.wait_slice.as_millis() as u64,
        }
    }
}

/// Live view settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveViewSettings {
    /// Frame rate used when a start request carries none
    pub default_fps: f64,
    /// Upper bound for requested frame rates
    pub max_fps: f64,
}

impl Default for LiveViewSettings {
    fn default() -> Self {
        let live = LiveSettings::default();
        Self {
            default_fps: live.default_fps,
            max_fps: live.max_fps,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub directive: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            json: false,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Event bus settings
    pub bus: BusSettings,
    /// Acquisition settings
    pub acquisition: AcquisitionSettings,
    /// Live view settings
    pub live: LiveViewSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

fn format_of(path: &Path) -> SettingsResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        other => Err(SettingsError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

impl EngineSettings {
    /// Create settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default settings file location under the platform config directory
    pub fn default_path() -> SettingsResult<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            SettingsError::ConfigDirectory("no config directory on this platform".to_string())
        })?;
        Ok(base.join("scopekit").join(SETTINGS_FILE_NAME))
    }

    /// Load settings from file (TOML or JSON)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path)?;

        let settings: Self = match format {
            Format::Toml => toml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };

        settings.validate()?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load settings from `path`, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save settings to file (TOML or JSON), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        let format = format_of(path)?;

        let content = match format {
            Format::Toml => toml::to_string_pretty(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        tracing::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> SettingsResult<()> {
        if self.bus.channel_capacity == 0 {
            return Err(SettingsError::invalid("bus.channel_capacity", "must be > 0"));
        }
        if self.bus.enable_history && self.bus.max_history_size == 0 {
            return Err(SettingsError::invalid(
                "bus.max_history_size",
                "must be > 0 when history is enabled",
            ));
        }

        if self.acquisition.pause_poll_ms == 0 {
            return Err(SettingsError::invalid("acquisition.pause_poll_ms", "must be > 0"));
        }
        if self.acquisition.wait_slice_ms == 0 {
            return Err(SettingsError::invalid("acquisition.wait_slice_ms", "must be > 0"));
        }

        for (key, fps) in [
            ("live.default_fps", self.live.default_fps),
            ("live.max_fps", self.live.max_fps),
        ] {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(SettingsError::invalid(key, "must be a positive number"));
            }
        }
        if self.live.default_fps > self.live.max_fps {
            return Err(SettingsError::invalid(
                "live.default_fps",
                "must not exceed live.max_fps",
            ));
        }

        if self.logging.directive.trim().is_empty() {
            return Err(SettingsError::invalid("logging.directive", "must not be empty"));
        }

        Ok(())
    }

    /// Event bus configuration
    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            channel_capacity: self.bus.channel_capacity,
            enable_history: self.bus.enable_history,
            max_history_size: self.bus.max_history_size,
            history_retention: Duration::from_secs(self.bus.history_retention_s),
        }
    }

    /// Acquisition worker timing
    pub fn acquisition_timing(&self) -> AcquisitionTiming {
        AcquisitionTiming {
            progress_interval: Duration::from_millis(self.acquisition.progress_interval_ms),
            pause_poll: Duration::from_millis(self.acquisition.pause_poll_ms),
            stage_settle: Duration::from_millis(self.acquisition.stage_settle_ms),
            wait_slice: Duration::from_millis(self.acquisition.wait_slice_ms),
        }
    }

    /// Live view frame rates
    pub fn live_settings(&self) -> LiveSettings {
        LiveSettings {
            default_fps: self.live.default_fps,
            max_fps: self.live.max_fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.acquisition.pause_enabled);
        assert_eq!(settings.acquisition_timing(), AcquisitionTiming::default());
        assert_eq!(settings.live_settings(), LiveSettings::default());
        assert_eq!(settings.bus_config().channel_capacity, 1024);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: EngineSettings = toml::from_str(
            r#"
            [acquisition]
            pause_enabled = false

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert!(!settings.acquisition.pause_enabled);
        assert_eq!(settings.acquisition.progress_interval_ms, 250);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.directive, "info");
        assert_eq!(settings.live, LiveViewSettings::default());
    }

    #[test]
    fn test_validation() {
        let mut settings = EngineSettings::default();
        settings.live.default_fps = 60.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidSetting { key, .. }) if key == "live.default_fps"
        ));

        let mut settings = EngineSettings::default();
        settings.acquisition.pause_poll_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = EngineSettings::default();
        settings.bus.enable_history = true;
        settings.bus.max_history_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            format_of(Path::new("settings.yaml")),
            Err(SettingsError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
        assert!(format_of(Path::new("settings")).is_err());
    }

    #[test]
    fn test_default_path_is_namespaced() {
        if let Ok(path) = EngineSettings::default_path() {
            assert!(path.ends_with("scopekit/settings.toml"));
        }
    }
}
