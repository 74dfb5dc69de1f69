//! Camera service

use parking_lot::{Mutex, MutexGuard};

use scopekit_core::event_bus::{Command, EventKind, State};
use scopekit_core::{HardwareAction, HardwareError};

use crate::hardware::{Camera, DeviceResult, Frame};
use crate::service::{Service, ServiceContext};

const NAME: &str = "camera";

/// Thread-safe wrapper around one camera.
///
/// Exposure and gain are clamped to the device's range; non-finite values are
/// refused before the device is touched.
///
/// Besides the device lock the service has a session lock. Live view holds it
/// for a whole mode-check, capture and delivery cycle, and a workflow taking
/// the camera over changes the global mode under it, so no live frame is
/// captured once another workflow owns the camera.
pub struct CameraService {
    ctx: ServiceContext,
    camera: Mutex<Box<dyn Camera>>,
    session: Mutex<()>,
}

impl CameraService {
    /// Wrap a camera driver
    pub fn new(camera: impl Camera + 'static, ctx: ServiceContext) -> Self {
        Self {
            ctx,
            camera: Mutex::new(Box::new(camera)),
            session: Mutex::new(()),
        }
    }

    /// Hold the camera session; blocks while a live frame is in flight
    pub fn lock_session(&self) -> MutexGuard<'_, ()> {
        self.session.lock()
    }

    /// Set exposure, returning the value actually applied
    pub fn set_exposure_time(&self, exposure_ms: f64) -> DeviceResult<f64> {
        if !exposure_ms.is_finite() {
            return Err(HardwareError::invalid_input(
                NAME,
                format!("exposure time {} ms is not finite", exposure_ms),
            ));
        }
        let applied = {
            let mut camera = self.camera.lock();
            let (min, max) = camera.exposure_limits();
            let applied = exposure_ms.clamp(min, max);
            tracing::debug!("Setting exposure time to {} ms", applied);
            camera.set_exposure(applied)?;
            applied
        };
        self.ctx.publish(State::ExposureTimeChanged {
            exposure_ms: applied,
        });
        Ok(applied)
    }

    /// Current exposure in milliseconds
    pub fn exposure_time(&self) -> f64 {
        self.camera.lock().exposure()
    }

    /// Exposure range (min, max) in milliseconds
    pub fn exposure_limits(&self) -> (f64, f64) {
        self.camera.lock().exposure_limits()
    }

    /// Set analog gain, returning the value actually applied
    pub fn set_analog_gain(&self, gain: f64) -> DeviceResult<f64> {
        if !gain.is_finite() {
            return Err(HardwareError::invalid_input(
                NAME,
                format!("analog gain {} is not finite", gain),
            ));
        }
        let applied = {
            let mut camera = self.camera.lock();
            let (min, max) = camera.gain_range();
            let applied = gain.clamp(min, max);
            tracing::debug!("Setting analog gain to {}", applied);
            camera.set_gain(applied)?;
            applied
        };
        self.ctx.publish(State::AnalogGainChanged { gain: applied });
        Ok(applied)
    }

    /// Current analog gain
    pub fn analog_gain(&self) -> f64 {
        self.camera.lock().gain()
    }

    /// Start streaming; no event when already streaming
    pub fn start_streaming(&self) -> DeviceResult<()> {
        let changed = {
            let mut camera = self.camera.lock();
            if camera.is_streaming() {
                false
            } else {
                camera.start_streaming()?;
                true
            }
        };
        if changed {
            self.ctx.publish(State::StreamingChanged { streaming: true });
        }
        Ok(())
    }

    /// Stop streaming; no event when already stopped
    pub fn stop_streaming(&self) -> DeviceResult<()> {
        let changed = {
            let mut camera = self.camera.lock();
            if camera.is_streaming() {
                camera.stop_streaming()?;
                true
            } else {
                false
            }
        };
        if changed {
            self.ctx.publish(State::StreamingChanged { streaming: false });
        }
        Ok(())
    }

    /// Whether the camera is streaming
    pub fn is_streaming(&self) -> bool {
        self.camera.lock().is_streaming()
    }

    /// Trigger and read one frame while holding the camera lock
    pub fn capture_frame(&self) -> DeviceResult<Frame> {
        let mut camera = self.camera.lock();
        camera.trigger()?;
        camera.read_frame()
    }
}

impl Service for CameraService {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[EventKind::SetExposureTime, EventKind::SetAnalogGain]
    }

    fn handle_command(&self, command: &Command) {
        if !self.ctx.admit(NAME, command, HardwareAction::CameraSettings) {
            return;
        }
        let result = match command {
            Command::SetExposureTime { exposure_ms } => self.set_exposure_time(*exposure_ms),
            Command::SetAnalogGain { gain } => self.set_analog_gain(*gain),
            _ => return,
        };
        if let Err(e) = result {
            self.ctx.report_command_error(NAME, command, &e);
        }
    }
}
