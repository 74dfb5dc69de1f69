//! Device traits and the frame data plane.
//!
//! Vendor drivers and the simulated devices in [`crate::sim`] implement these
//! traits. Each device is owned by exactly one service and only ever touched
//! while that service holds its lock, so the traits take `&mut self`.
//!
//! Frames never travel through the event bus: workers hand them straight to
//! a [`FrameSink`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use scopekit_core::data::{ScanIndices, StagePosition};
use scopekit_core::{HardwareError, RunId};

/// Result type for device operations
pub type DeviceResult<T> = std::result::Result<T, HardwareError>;

/// Travel range of an XYZ stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// Lower corner
    pub min: StagePosition,
    /// Upper corner
    pub max: StagePosition,
}

impl StageLimits {
    /// Clamp a target into the travel range
    pub fn clamp(&self, target: StagePosition) -> StagePosition {
        StagePosition::new(
            target.x_mm.clamp(self.min.x_mm, self.max.x_mm),
            target.y_mm.clamp(self.min.y_mm, self.max.y_mm),
            target.z_mm.clamp(self.min.z_mm, self.max.z_mm),
        )
    }

    /// Whether a position lies inside the travel range
    pub fn contains(&self, position: StagePosition) -> bool {
        self.clamp(position) == position
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            min: StagePosition::new(0.0, 0.0, 0.0),
            max: StagePosition::new(120.0, 80.0, 10.0),
        }
    }
}

/// Motorized XYZ stage
pub trait Stage: Send {
    /// Move to an absolute position and block until settled
    fn move_to(&mut self, target: StagePosition) -> DeviceResult<()>;

    /// Current position
    fn position(&self) -> DeviceResult<StagePosition>;

    /// Home all axes
    fn home(&mut self) -> DeviceResult<()>;

    /// Travel range
    fn limits(&self) -> StageLimits;
}

/// Scientific camera with software trigger
pub trait Camera: Send {
    /// Exposure range (min, max) in milliseconds
    fn exposure_limits(&self) -> (f64, f64);

    /// Set exposure in milliseconds
    fn set_exposure(&mut self, exposure_ms: f64) -> DeviceResult<()>;

    /// Current exposure in milliseconds
    fn exposure(&self) -> f64;

    /// Analog gain range (min, max)
    fn gain_range(&self) -> (f64, f64);

    /// Set analog gain
    fn set_gain(&mut self, gain: f64) -> DeviceResult<()>;

    /// Current analog gain
    fn gain(&self) -> f64;

    /// Begin streaming; triggers are only accepted while streaming
    fn start_streaming(&mut self) -> DeviceResult<()>;

    /// Stop streaming
    fn stop_streaming(&mut self) -> DeviceResult<()>;

    /// Whether the camera is streaming
    fn is_streaming(&self) -> bool;

    /// Fire a software trigger
    fn trigger(&mut self) -> DeviceResult<()>;

    /// Read the frame produced by the last trigger
    fn read_frame(&mut self) -> DeviceResult<Frame>;
}

/// Multi-source light engine
pub trait Illumination: Send {
    /// Available source identifiers
    fn sources(&self) -> Vec<u32>;

    /// Set a source's intensity, 0-100
    fn set_intensity(&mut self, source: u32, intensity_percent: f64) -> DeviceResult<()>;

    /// Open or close a source's shutter
    fn set_enabled(&mut self, source: u32, on: bool) -> DeviceResult<()>;

    /// Whether a source is currently on
    fn is_enabled(&self, source: u32) -> bool;
}

/// Emission filter wheel with 1-based slots
pub trait FilterWheel: Send {
    /// Number of slots
    fn slots(&self) -> u32;

    /// Rotate to a slot
    fn set_position(&mut self, position: u32) -> DeviceResult<()>;

    /// Current slot
    fn position(&self) -> DeviceResult<u32>;

    /// Find the index mark; leaves the wheel at slot 1
    fn home(&mut self) -> DeviceResult<()>;
}

/// Focus measurement device (laser reflection or image based)
pub trait FocusDevice: Send {
    /// Measure focus around `z_mm` and return the correction to apply, in
    /// micrometers, or `None` when no focus could be found
    fn find_focus(&mut self, z_mm: f64) -> DeviceResult<Option<f64>>;
}

/// One camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonic frame counter from the camera
    pub frame_id: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel data
    pub pixels: Vec<u16>,
    /// Exposure the frame was taken with
    pub exposure_ms: f64,
}

impl Frame {
    /// Mean pixel intensity
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().map(|&p| p as f64).sum::<f64>() / self.pixels.len() as f64
    }
}

/// Context a frame was captured in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Acquisition run, absent for live view
    pub run_id: Option<RunId>,
    /// Region name, absent for live view
    pub region: Option<String>,
    /// Scan position, absent for live view
    pub indices: Option<ScanIndices>,
    /// Channel names lit for this frame, in dispatch order
    pub channels: Vec<String>,
    /// Stage position at capture, when known
    pub position: Option<StagePosition>,
    /// Capture time
    pub captured_at: DateTime<Utc>,
}

/// Consumer of captured frames (writers, displays, analysis)
pub trait FrameSink: Send + Sync {
    /// Take ownership of a frame. Called on worker threads; must not block
    /// for long.
    fn deliver_frame(&self, frame: Frame, metadata: FrameMetadata);
}

/// In-memory sink, mostly for tests
#[derive(Debug, Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<(Frame, FrameMetadata)>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames received
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether no frame was received
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Metadata of every received frame, in arrival order
    pub fn metadata(&self) -> Vec<FrameMetadata> {
        self.frames.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    /// Remove and return everything received so far
    pub fn take(&self) -> Vec<(Frame, FrameMetadata)> {
        std::mem::take(&mut *self.frames.lock())
    }
}

impl FrameSink for CollectingSink {
    fn deliver_frame(&self, frame: Frame, metadata: FrameMetadata) {
        self.frames.lock().push((frame, metadata));
    }
}

/// Sink that drops every frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver_frame(&self, _frame: Frame, _metadata: FrameMetadata) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_clamp() {
        let limits = StageLimits::default();
        let clamped = limits.clamp(StagePosition::new(-5.0, 40.0, 99.0));
        assert_eq!(clamped, StagePosition::new(0.0, 40.0, 10.0));
        assert!(limits.contains(clamped));
        assert!(!limits.contains(StagePosition::new(-5.0, 40.0, 1.0)));
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        assert!(sink.is_empty());
        sink.deliver_frame(
            Frame {
                frame_id: 1,
                width: 2,
                height: 1,
                pixels: vec![10, 30],
                exposure_ms: 5.0,
            },
            FrameMetadata {
                run_id: None,
                region: None,
                indices: None,
                channels: vec!["BF".to_string()],
                position: None,
                captured_at: Utc::now(),
            },
        );
        assert_eq!(sink.len(), 1);
        let frames = sink.take();
        assert_eq!(frames[0].0.mean(), 20.0);
        assert!(sink.is_empty());
    }
}
