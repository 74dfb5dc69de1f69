//! Data models shared by services, controllers and the UI
//!
//! This module provides:
//! - Stage axes and positions
//! - The immutable acquisition configuration value object
//! - The acquisition state snapshot published on every phase change

pub mod acquisition;

pub use acquisition::{
    AcquisitionConfig, AcquisitionPhase, AcquisitionState, AutofocusPlan, ChannelGroup,
    ChannelSpec, GroupMode, Region, ScanIndices, ScanTotals, TimeSeries, ZAnchor, ZStack,
    MAX_CAPTURE_UNITS,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage axis identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X-axis (lateral).
    X,
    /// Y-axis (lateral).
    Y,
    /// Z-axis (focus).
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Stage position in millimeters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// X-axis position
    pub x_mm: f64,
    /// Y-axis position
    pub y_mm: f64,
    /// Z-axis position
    pub z_mm: f64,
}

impl StagePosition {
    /// Create a new position
    pub fn new(x_mm: f64, y_mm: f64, z_mm: f64) -> Self {
        Self { x_mm, y_mm, z_mm }
    }

    /// Read one axis
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x_mm,
            Axis::Y => self.y_mm,
            Axis::Z => self.z_mm,
        }
    }

    /// Return a copy with one axis replaced
    pub fn with_axis(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x_mm = value,
            Axis::Y => self.y_mm = value,
            Axis::Z => self.z_mm = value,
        }
        self
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X:{:.4} Y:{:.4} Z:{:.4}",
            self.x_mm, self.y_mm, self.z_mm
        )
    }
}
