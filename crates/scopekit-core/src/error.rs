//! Error handling for ScopeKit
//!
//! Provides error types for every layer of the control plane:
//! - Mode errors (illegal global mode transitions)
//! - Configuration errors (acquisition config validation)
//! - Hardware errors (device faults raised inside services)
//! - Event bus errors (dispatch thread lifecycle)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::mode::GlobalMode;

/// Global mode error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
    /// The requested transition is not allowed by the mode table
    #[error("Invalid mode transition from {from} to {to}")]
    InvalidTransition {
        /// The current mode.
        from: GlobalMode,
        /// The requested mode.
        to: GlobalMode,
    },
}

/// Acquisition configuration error type
///
/// Raised by `AcquisitionConfig::validate` before a run is allowed to start.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// No regions configured
    #[error("Acquisition needs at least one region")]
    NoRegions,

    /// No channel groups configured
    #[error("Acquisition needs at least one channel group")]
    NoChannelGroups,

    /// A channel group has no channels
    #[error("Channel group '{group}' has no channels")]
    EmptyChannelGroup {
        /// The offending group name.
        group: String,
    },

    /// Two regions share a name
    #[error("Duplicate region name '{name}'")]
    DuplicateRegion {
        /// The duplicated region name.
        name: String,
    },

    /// The scan would take more capture units than a run allows
    #[error("Acquisition has too many capture units (limit {max})")]
    TooManyUnits {
        /// The per-run limit.
        max: u64,
    },

    /// A numeric field is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// The field path.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Build an `InvalidValue` error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Hardware error type
///
/// Represents faults raised by device drivers while a service performs an
/// operation on them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// The device reported a fault
    #[error("{device} fault: {reason}")]
    Fault {
        /// Device name.
        device: String,
        /// Fault description.
        reason: String,
    },

    /// The device did not complete the operation in time
    #[error("{device} timed out after {timeout_ms}ms")]
    Timeout {
        /// Device name.
        device: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The device is not in a state that allows the operation
    #[error("{device} not ready: {reason}")]
    NotReady {
        /// Device name.
        device: String,
        /// Why the device is not ready.
        reason: String,
    },

    /// A requested value cannot be sent to the device
    #[error("{device} refused input: {reason}")]
    InvalidInput {
        /// Device name.
        device: String,
        /// What was wrong with the value.
        reason: String,
    },
}

impl HardwareError {
    /// Build a `Fault` error
    pub fn fault(device: impl Into<String>, reason: impl Into<String>) -> Self {
        HardwareError::Fault {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Build an `InvalidInput` error
    pub fn invalid_input(device: impl Into<String>, reason: impl Into<String>) -> Self {
        HardwareError::InvalidInput {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Whether the request was refused before reaching the device
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, HardwareError::InvalidInput { .. })
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, HardwareError::Timeout { .. })
    }
}

/// Error types for event bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The dispatch thread could not be spawned
    #[error("Failed to spawn dispatch thread: {reason}")]
    SpawnFailed {
        /// OS error description.
        reason: String,
    },
}

/// Main error type for ScopeKit
///
/// A unified error type that can represent any error from the core layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Mode error
    #[error(transparent)]
    Mode(#[from] ModeError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Hardware error
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// Event bus error
    #[error(transparent)]
    Bus(#[from] EventBusError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a hardware error
    pub fn is_hardware_error(&self) -> bool {
        matches!(self, Error::Hardware(_))
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
