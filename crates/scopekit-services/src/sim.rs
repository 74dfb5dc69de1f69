//! Simulated devices
//!
//! In-memory implementations of the device traits for tests and the headless
//! demo. Every simulated device is a cheap `Clone` handle over shared state,
//! so a test can keep one handle for inspection and fault injection while the
//! service owns another.
//!
//! Latency is simulated with blocking sleeps, matching the blocking device
//! traits: these devices are only driven from worker threads or from short
//! command handlers.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use scopekit_core::data::StagePosition;
use scopekit_core::HardwareError;

use crate::hardware::{
    Camera, DeviceResult, FilterWheel, FocusDevice, Frame, Illumination, Stage, StageLimits,
};

/// Injects a fault after a number of successful calls
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<FaultState>>,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: u64,
    fail_at: Option<(u64, String)>,
    sticky: bool,
}

impl FaultInjector {
    /// Fail the call made after `successes` more successful calls
    pub fn fail_after(&self, successes: u64, reason: impl Into<String>) {
        let mut state = self.inner.lock();
        let at = state.calls + successes;
        state.fail_at = Some((at, reason.into()));
        state.sticky = false;
    }

    /// Fail every call from now on
    pub fn fail_always(&self, reason: impl Into<String>) {
        let mut state = self.inner.lock();
        let at = state.calls;
        state.fail_at = Some((at, reason.into()));
        state.sticky = true;
    }

    /// Stop injecting faults
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.fail_at = None;
        state.sticky = false;
    }

    /// Calls counted so far
    pub fn calls(&self) -> u64 {
        self.inner.lock().calls
    }

    fn check(&self, device: &str) -> DeviceResult<()> {
        let mut state = self.inner.lock();
        let call = state.calls;
        state.calls += 1;
        let fired = match &state.fail_at {
            Some((at, reason)) if call == *at || (state.sticky && call >= *at) => {
                Some(reason.clone())
            }
            _ => None,
        };
        match fired {
            Some(reason) => {
                if !state.sticky {
                    state.fail_at = None;
                }
                Err(HardwareError::fault(device, reason))
            }
            None => Ok(()),
        }
    }
}

fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        thread::sleep(latency);
    }
}

// =============================================================================
// Stage
// =============================================================================

#[derive(Debug)]
struct StageState {
    position: StagePosition,
    moves: Vec<StagePosition>,
}

/// Simulated XYZ stage
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    state: Arc<Mutex<StageState>>,
    limits: StageLimits,
    latency: Duration,
    faults: FaultInjector,
}

impl SimulatedStage {
    /// Stage at the origin with default limits and no latency
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StageState {
                position: StagePosition::default(),
                moves: Vec::new(),
            })),
            limits: StageLimits::default(),
            latency: Duration::ZERO,
            faults: FaultInjector::default(),
        }
    }

    /// Set the travel range
    pub fn with_limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sleep this long on every move
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fault injection handle
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Current position without going through the trait
    pub fn current(&self) -> StagePosition {
        self.state.lock().position
    }

    /// Every completed move target, in order
    pub fn moves(&self) -> Vec<StagePosition> {
        self.state.lock().moves.clone()
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SimulatedStage {
    fn move_to(&mut self, target: StagePosition) -> DeviceResult<()> {
        self.faults.check("stage")?;
        if !self.limits.contains(target) {
            return Err(HardwareError::fault(
                "stage",
                format!("target {} outside travel range", target),
            ));
        }
        simulate_latency(self.latency);
        let mut state = self.state.lock();
        state.position = target;
        state.moves.push(target);
        Ok(())
    }

    fn position(&self) -> DeviceResult<StagePosition> {
        Ok(self.state.lock().position)
    }

    fn home(&mut self) -> DeviceResult<()> {
        self.faults.check("stage")?;
        simulate_latency(self.latency);
        self.state.lock().position = self.limits.min;
        Ok(())
    }

    fn limits(&self) -> StageLimits {
        self.limits
    }
}

// =============================================================================
// Camera
// =============================================================================

#[derive(Debug)]
struct CameraState {
    exposure_ms: f64,
    gain: f64,
    streaming: bool,
    armed: bool,
    frame_id: u64,
    triggers: u64,
}

/// Simulated camera producing small gradient frames
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    state: Arc<Mutex<CameraState>>,
    width: u32,
    height: u32,
    latency: Duration,
    faults: FaultInjector,
}

impl SimulatedCamera {
    /// 16x16 camera, 10 ms exposure, no latency
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraState {
                exposure_ms: 10.0,
                gain: 0.0,
                streaming: false,
                armed: false,
                frame_id: 0,
                triggers: 0,
            })),
            width: 16,
            height: 16,
            latency: Duration::ZERO,
            faults: FaultInjector::default(),
        }
    }

    /// Sleep this long on every frame readout
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fault injection handle
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Triggers fired so far
    pub fn trigger_count(&self) -> u64 {
        self.state.lock().triggers
    }

    /// Whether the camera is streaming, without going through the trait
    pub fn streaming(&self) -> bool {
        self.state.lock().streaming
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera for SimulatedCamera {
    fn exposure_limits(&self) -> (f64, f64) {
        (0.1, 10_000.0)
    }

    fn set_exposure(&mut self, exposure_ms: f64) -> DeviceResult<()> {
        self.state.lock().exposure_ms = exposure_ms;
        Ok(())
    }

    fn exposure(&self) -> f64 {
        self.state.lock().exposure_ms
    }

    fn gain_range(&self) -> (f64, f64) {
        (0.0, 24.0)
    }

    fn set_gain(&mut self, gain: f64) -> DeviceResult<()> {
        self.state.lock().gain = gain;
        Ok(())
    }

    fn gain(&self) -> f64 {
        self.state.lock().gain
    }

    fn start_streaming(&mut self) -> DeviceResult<()> {
        self.state.lock().streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.streaming = false;
        state.armed = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    fn trigger(&mut self) -> DeviceResult<()> {
        self.faults.check("camera")?;
        let mut state = self.state.lock();
        if !state.streaming {
            return Err(HardwareError::NotReady {
                device: "camera".to_string(),
                reason: "trigger while not streaming".to_string(),
            });
        }
        state.armed = true;
        state.triggers += 1;
        Ok(())
    }

    fn read_frame(&mut self) -> DeviceResult<Frame> {
        simulate_latency(self.latency);
        let mut state = self.state.lock();
        if !state.armed {
            return Err(HardwareError::NotReady {
                device: "camera".to_string(),
                reason: "no pending trigger".to_string(),
            });
        }
        state.armed = false;
        state.frame_id += 1;

        let level = (state.exposure_ms * (1.0 + state.gain / 10.0)).min(u16::MAX as f64) as u16;
        let pixels = (0..self.width * self.height)
            .map(|i| level.saturating_add((i % self.width) as u16))
            .collect();

        Ok(Frame {
            frame_id: state.frame_id,
            width: self.width,
            height: self.height,
            pixels,
            exposure_ms: state.exposure_ms,
        })
    }
}

// =============================================================================
// Illumination
// =============================================================================

#[derive(Debug, Default)]
struct IlluminationState {
    intensity: BTreeMap<u32, f64>,
    enabled: BTreeMap<u32, bool>,
    switches: Vec<(u32, bool)>,
}

/// Simulated light engine
#[derive(Debug, Clone)]
pub struct SimulatedIllumination {
    state: Arc<Mutex<IlluminationState>>,
    sources: Vec<u32>,
    faults: FaultInjector,
}

impl SimulatedIllumination {
    /// Light engine with the given source identifiers, all off
    pub fn new(sources: Vec<u32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(IlluminationState::default())),
            sources,
            faults: FaultInjector::default(),
        }
    }

    /// Fault injection handle
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Whether any source is on
    pub fn any_on(&self) -> bool {
        self.state.lock().enabled.values().any(|on| *on)
    }

    /// Every shutter change, in order
    pub fn switches(&self) -> Vec<(u32, bool)> {
        self.state.lock().switches.clone()
    }
}

impl Default for SimulatedIllumination {
    fn default() -> Self {
        Self::new(vec![405, 488, 561, 638, 0])
    }
}

impl Illumination for SimulatedIllumination {
    fn sources(&self) -> Vec<u32> {
        self.sources.clone()
    }

    fn set_intensity(&mut self, source: u32, intensity_percent: f64) -> DeviceResult<()> {
        if !self.sources.contains(&source) {
            return Err(HardwareError::fault(
                "illumination",
                format!("unknown source {}", source),
            ));
        }
        self.state.lock().intensity.insert(source, intensity_percent);
        Ok(())
    }

    fn set_enabled(&mut self, source: u32, on: bool) -> DeviceResult<()> {
        if on {
            // Turning off must always work so cleanup can make things safe.
            self.faults.check("illumination")?;
        }
        if !self.sources.contains(&source) {
            return Err(HardwareError::fault(
                "illumination",
                format!("unknown source {}", source),
            ));
        }
        let mut state = self.state.lock();
        state.enabled.insert(source, on);
        state.switches.push((source, on));
        Ok(())
    }

    fn is_enabled(&self, source: u32) -> bool {
        self.state
            .lock()
            .enabled
            .get(&source)
            .copied()
            .unwrap_or(false)
    }
}

// =============================================================================
// Filter wheel
// =============================================================================

/// Simulated filter wheel
#[derive(Debug, Clone)]
pub struct SimulatedFilterWheel {
    position: Arc<Mutex<u32>>,
    slots: u32,
    latency: Duration,
    faults: FaultInjector,
}

impl SimulatedFilterWheel {
    /// Wheel with `slots` positions, at slot 1
    pub fn new(slots: u32) -> Self {
        Self {
            position: Arc::new(Mutex::new(1)),
            slots: slots.max(1),
            latency: Duration::ZERO,
            faults: FaultInjector::default(),
        }
    }

    /// Sleep this long on every rotation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fault injection handle
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Current slot without going through the trait
    pub fn current(&self) -> u32 {
        *self.position.lock()
    }
}

impl Default for SimulatedFilterWheel {
    fn default() -> Self {
        Self::new(8)
    }
}

impl FilterWheel for SimulatedFilterWheel {
    fn slots(&self) -> u32 {
        self.slots
    }

    fn set_position(&mut self, position: u32) -> DeviceResult<()> {
        self.faults.check("filter wheel")?;
        if position == 0 || position > self.slots {
            return Err(HardwareError::fault(
                "filter wheel",
                format!("slot {} out of range 1..={}", position, self.slots),
            ));
        }
        simulate_latency(self.latency);
        *self.position.lock() = position;
        Ok(())
    }

    fn position(&self) -> DeviceResult<u32> {
        Ok(*self.position.lock())
    }

    fn home(&mut self) -> DeviceResult<()> {
        self.faults.check("filter wheel")?;
        simulate_latency(self.latency);
        *self.position.lock() = 1;
        Ok(())
    }
}

// =============================================================================
// Focus
// =============================================================================

/// Simulated focus device returning a fixed correction
#[derive(Debug, Clone)]
pub struct SimulatedFocus {
    correction_um: Arc<Mutex<Option<f64>>>,
    measurements: Arc<Mutex<Vec<f64>>>,
    faults: FaultInjector,
}

impl SimulatedFocus {
    /// Focus device that always reports `correction_um`
    pub fn new(correction_um: Option<f64>) -> Self {
        Self {
            correction_um: Arc::new(Mutex::new(correction_um)),
            measurements: Arc::new(Mutex::new(Vec::new())),
            faults: FaultInjector::default(),
        }
    }

    /// Change the reported correction
    pub fn set_correction(&self, correction_um: Option<f64>) {
        *self.correction_um.lock() = correction_um;
    }

    /// Z positions focus was measured at
    pub fn measurements(&self) -> Vec<f64> {
        self.measurements.lock().clone()
    }

    /// Fault injection handle
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

impl Default for SimulatedFocus {
    fn default() -> Self {
        Self::new(Some(0.0))
    }
}

impl FocusDevice for SimulatedFocus {
    fn find_focus(&mut self, z_mm: f64) -> DeviceResult<Option<f64>> {
        self.faults.check("focus")?;
        self.measurements.lock().push(z_mm);
        Ok(*self.correction_um.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injector_fires_once() {
        let faults = FaultInjector::default();
        faults.fail_after(2, "jam");
        assert!(faults.check("x").is_ok());
        assert!(faults.check("x").is_ok());
        assert!(faults.check("x").is_err());
        assert!(faults.check("x").is_ok());
        assert_eq!(faults.calls(), 4);
    }

    #[test]
    fn test_fault_injector_sticky() {
        let faults = FaultInjector::default();
        faults.fail_always("dead");
        assert!(faults.check("x").is_err());
        assert!(faults.check("x").is_err());
        faults.clear();
        assert!(faults.check("x").is_ok());
    }

    #[test]
    fn test_camera_requires_streaming_and_trigger() {
        let mut camera = SimulatedCamera::new();
        assert!(camera.trigger().is_err());
        camera.start_streaming().unwrap();
        assert!(camera.read_frame().is_err());
        camera.trigger().unwrap();
        let frame = camera.read_frame().unwrap();
        assert_eq!(frame.frame_id, 1);
        assert_eq!(frame.pixels.len(), 256);
        assert_eq!(camera.trigger_count(), 1);
    }

    #[test]
    fn test_stage_handle_shares_state() {
        let stage = SimulatedStage::new();
        let mut driver = stage.clone();
        driver.move_to(StagePosition::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(stage.current(), StagePosition::new(1.0, 2.0, 3.0));
        assert!(driver.move_to(StagePosition::new(-1.0, 0.0, 0.0)).is_err());
        assert_eq!(stage.moves().len(), 1);
    }

    #[test]
    fn test_illumination_off_never_faults() {
        let mut light = SimulatedIllumination::default();
        light.faults().fail_always("driver crashed");
        assert!(light.set_enabled(488, true).is_err());
        assert!(light.set_enabled(488, false).is_ok());
        assert!(!light.any_on());
    }
}
