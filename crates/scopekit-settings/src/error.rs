//! Error types for the settings crate.

use std::io;
use thiserror::Error;

/// Errors that can occur while loading, saving or validating settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The file extension is neither `.toml` nor `.json`.
    #[error("Unsupported settings format: {0}")]
    UnsupportedFormat(String),

    /// A setting value is invalid.
    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    /// The platform config directory could not be resolved.
    #[error("No settings directory: {0}")]
    ConfigDirectory(String),

    /// Reading or writing the settings file failed.
    #[error("Settings file I/O failed: {0}")]
    IoError(#[from] io::Error),

    /// Malformed JSON settings.
    #[error("Invalid JSON settings: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed TOML settings.
    #[error("Invalid TOML settings: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Settings could not be rendered as TOML.
    #[error("Cannot write TOML settings: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl SettingsError {
    /// Shorthand for [`SettingsError::InvalidSetting`]
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SettingsError::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result of a settings operation
pub type SettingsResult<T> = Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_error_display() {
        let err = SettingsError::invalid("live.default_fps", "must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid setting 'live.default_fps': must be positive"
        );

        let err = SettingsError::UnsupportedFormat("yaml".to_string());
        assert_eq!(err.to_string(), "Unsupported settings format: yaml");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let settings_err: SettingsError = io_err.into();
        assert!(matches!(settings_err, SettingsError::IoError(_)));

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let settings_err: SettingsError = json_err.into();
        assert!(matches!(settings_err, SettingsError::JsonError(_)));
    }
}
