//! ScopeKit Settings Crate
//!
//! Engine configuration: loading, saving and validating settings files and
//! turning them into the runtime configuration of the bus, the acquisition
//! worker and live view.

pub mod config;
pub mod error;

pub use config::{
    AcquisitionSettings, BusSettings, EngineSettings, LiveViewSettings, LoggingSettings,
    SETTINGS_FILE_NAME,
};
pub use error::{SettingsError, SettingsResult};
