//! Global mode gate.
//!
//! A single enum-valued mode arbitrates which workflow owns the hardware.
//! Services consult the gate before executing hardware-mutating commands;
//! controllers change the mode when entering and leaving a workflow.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ModeError;
use crate::event_bus::{EventBus, State};

/// System-wide operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GlobalMode {
    /// No workflow owns the hardware.
    #[default]
    Idle,
    /// Continuous live view is streaming.
    Live,
    /// A multi-dimensional acquisition is running.
    Acquiring,
    /// An acquisition is winding down after a stop request.
    Aborting,
    /// Hardware could not be returned to a safe state.
    Error,
}

impl GlobalMode {
    /// Check whether the mode table allows moving to `next`.
    ///
    /// Staying in the same mode is always allowed (and is a no-op for the gate).
    pub fn can_transition_to(self, next: GlobalMode) -> bool {
        use GlobalMode::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Idle, Live | Acquiring | Error) => true,
            (Live, Idle | Acquiring | Error) => true,
            (Acquiring, Idle | Live | Aborting | Error) => true,
            (Aborting, Idle | Live | Error) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }

    /// Whether a workflow currently owns the hardware exclusively
    pub fn is_busy(self) -> bool {
        matches!(self, GlobalMode::Acquiring | GlobalMode::Aborting)
    }
}

impl fmt::Display for GlobalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GlobalMode::Idle => "Idle",
            GlobalMode::Live => "Live",
            GlobalMode::Acquiring => "Acquiring",
            GlobalMode::Aborting => "Aborting",
            GlobalMode::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Hardware-mutating action a command wants to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareAction {
    /// Moving or homing the stage.
    StageMotion,
    /// Changing exposure or gain.
    CameraSettings,
    /// Switching illumination sources.
    Illumination,
    /// Moving or homing the filter wheel.
    FilterWheel,
    /// Starting or stopping camera streaming.
    Streaming,
}

impl fmt::Display for HardwareAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareAction::StageMotion => "stage motion",
            HardwareAction::CameraSettings => "camera settings",
            HardwareAction::Illumination => "illumination",
            HardwareAction::FilterWheel => "filter wheel",
            HardwareAction::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Holds the current [`GlobalMode`] and announces every change on the bus.
pub struct GlobalModeGate {
    mode: Mutex<GlobalMode>,
    bus: Arc<EventBus>,
}

impl GlobalModeGate {
    /// Create a gate in `Idle` that publishes changes on `bus`
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            mode: Mutex::new(GlobalMode::Idle),
            bus,
        }
    }

    /// Current mode
    pub fn get_mode(&self) -> GlobalMode {
        *self.mode.lock()
    }

    /// Move to `new_mode`.
    ///
    /// Returns `Ok(false)` when already in that mode (nothing is published),
    /// `Ok(true)` when the mode changed and `ModeChanged` was published.
    pub fn set_mode(&self, new_mode: GlobalMode, reason: &str) -> Result<bool, ModeError> {
        let old = {
            let mut mode = self.mode.lock();
            let old = *mode;
            if old == new_mode {
                return Ok(false);
            }
            if !old.can_transition_to(new_mode) {
                tracing::warn!(from = %old, to = %new_mode, reason, "Refused mode transition");
                return Err(ModeError::InvalidTransition { from: old, to: new_mode });
            }
            *mode = new_mode;
            old
        };
        self.announce(old, new_mode, reason);
        Ok(true)
    }

    /// Move to `new_mode` only if the current mode is `expected`.
    ///
    /// Returns true when the transition happened.
    pub fn try_set_mode(&self, expected: GlobalMode, new_mode: GlobalMode, reason: &str) -> bool {
        {
            let mut mode = self.mode.lock();
            if *mode != expected || expected == new_mode || !expected.can_transition_to(new_mode) {
                return false;
            }
            *mode = new_mode;
        }
        self.announce(expected, new_mode, reason);
        true
    }

    /// Return to a mode recorded before a workflow started.
    ///
    /// Falls back to `Idle` when the table does not allow going straight back.
    pub fn restore_mode(&self, previous: GlobalMode, reason: &str) -> GlobalMode {
        match self.set_mode(previous, reason) {
            Ok(_) => previous,
            Err(e) => {
                tracing::warn!("Cannot restore {}: {}; falling back to Idle", previous, e);
                match self.set_mode(GlobalMode::Idle, reason) {
                    Ok(_) => GlobalMode::Idle,
                    Err(_) => self.get_mode(),
                }
            }
        }
    }

    /// Whether command-originated hardware changes are currently refused
    pub fn blocked_for_hardware_commands(&self) -> bool {
        self.get_mode().is_busy()
    }

    /// Whether a command may perform `action` in the current mode
    pub fn permits(&self, action: HardwareAction) -> bool {
        match action {
            HardwareAction::StageMotion
            | HardwareAction::CameraSettings
            | HardwareAction::Illumination
            | HardwareAction::FilterWheel
            | HardwareAction::Streaming => !self.blocked_for_hardware_commands(),
        }
    }

    fn announce(&self, old: GlobalMode, new: GlobalMode, reason: &str) {
        tracing::info!("Mode {} -> {} ({})", old, new, reason);
        self.bus.publish(State::ModeChanged {
            old,
            new,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for GlobalModeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalModeGate")
            .field("mode", &self.get_mode())
            .finish()
    }
}
