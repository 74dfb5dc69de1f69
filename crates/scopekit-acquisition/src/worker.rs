//! Acquisition worker thread
//!
//! The worker walks a [`ScanPlan`] and drives the hardware services directly.
//! It never consults the mode gate: the controller put the system into
//! `Acquiring` before spawning it, which locks command-originated changes out.
//!
//! Whatever happens inside the scan (completion, stop request, device fault or
//! panic) the worker switches illumination off, stops streaming and publishes
//! exactly one `AcquisitionFinished`.

use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scopekit_core::data::{AcquisitionConfig, Region, ZAnchor};
use scopekit_core::event_bus::{panic_message, EventBus, State};
use scopekit_core::{AcquisitionFinished, RunId};
use scopekit_services::{
    AutofocusService, CameraService, DeviceResult, FilterWheelService, Frame, FrameMetadata,
    FrameSink, IlluminationService, StageService,
};

use crate::plan::{CaptureUnit, ScanPlan};
use crate::progress::ProgressTracker;

/// Name given to the worker thread
pub const WORKER_THREAD_NAME: &str = "acquisition-worker";

/// Timing knobs for the worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionTiming {
    /// Minimum spacing between progress reports
    pub progress_interval: Duration,
    /// Poll interval while paused
    pub pause_poll: Duration,
    /// Extra wait after every XY move
    pub stage_settle: Duration,
    /// Longest uninterrupted sleep while waiting for a time point
    pub wait_slice: Duration,
}

impl Default for AcquisitionTiming {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(250),
            pause_poll: Duration::from_millis(50),
            stage_settle: Duration::ZERO,
            wait_slice: Duration::from_millis(50),
        }
    }
}

/// Services a run drives
#[derive(Clone)]
pub struct AcquisitionHardware {
    /// XYZ stage
    pub stage: Arc<StageService>,
    /// Camera
    pub camera: Arc<CameraService>,
    /// Light engine
    pub illumination: Arc<IlluminationService>,
    /// Emission filter wheel, when fitted
    pub filter_wheel: Option<Arc<FilterWheelService>>,
    /// Focus device, when fitted
    pub autofocus: Option<Arc<AutofocusService>>,
    /// Destination of captured frames
    pub sink: Arc<dyn FrameSink>,
}

/// Flags the controller uses to steer a running worker
#[derive(Debug, Default)]
pub struct WorkerControl {
    cancel: AtomicBool,
    pause: AtomicBool,
}

impl WorkerControl {
    /// Ask the worker to stop at the next unit boundary
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn stop_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Ask the worker to park at the next unit boundary, or release it
    pub fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
    }

    /// Whether a pause is requested
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Completed,
    Aborted,
}

/// One run's worker. Consumed by [`AcquisitionWorker::run`].
pub struct AcquisitionWorker {
    run_id: RunId,
    config: Arc<AcquisitionConfig>,
    hardware: AcquisitionHardware,
    control: Arc<WorkerControl>,
    bus: Arc<EventBus>,
    timing: AcquisitionTiming,
}

impl AcquisitionWorker {
    /// Prepare a worker for a validated, run-stamped configuration
    pub fn new(
        run_id: RunId,
        config: Arc<AcquisitionConfig>,
        hardware: AcquisitionHardware,
        control: Arc<WorkerControl>,
        bus: Arc<EventBus>,
        timing: AcquisitionTiming,
    ) -> Self {
        Self {
            run_id,
            config,
            hardware,
            control,
            bus,
            timing,
        }
    }

    /// Execute the run to its end. Meant to be the body of the worker thread.
    pub fn run(self) {
        tracing::info!("{} worker ready", self.run_id);
        self.bus.publish(State::AcquisitionWorkerReady {
            run_id: self.run_id,
        });

        let mut tracker = ProgressTracker::new(
            self.run_id,
            self.config.totals(),
            self.timing.progress_interval,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| self.scan(&mut tracker)));

        let (success, aborted, error) = match outcome {
            Ok(Ok(ScanOutcome::Completed)) => (true, false, None),
            Ok(Ok(ScanOutcome::Aborted)) => (false, true, None),
            Ok(Err(e)) => {
                tracing::error!("{} failed: {}", self.run_id, e);
                (false, false, Some(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("{} worker panicked: {}", self.run_id, message);
                (false, false, Some(format!("worker panicked: {}", message)))
            }
        };

        let hardware_safe = self.cleanup();
        let units_done = tracker.units_done();
        tracing::info!(
            run = %self.run_id,
            success,
            aborted,
            hardware_safe,
            units_done,
            "Acquisition finished"
        );
        self.bus.publish(State::AcquisitionFinished(AcquisitionFinished {
            run_id: self.run_id,
            success,
            aborted,
            error,
            hardware_safe,
            units_done,
        }));
    }

    fn scan(&self, tracker: &mut ProgressTracker) -> DeviceResult<ScanOutcome> {
        let plan = ScanPlan::new(&self.config);
        tracing::debug!("{} plan has {} units", self.run_id, plan.len());

        self.hardware.camera.start_streaming()?;

        let mut region_started = Instant::now();
        let mut focus_correction_um = 0.0;
        let mut plane_z_mm = 0.0;

        for unit in plan.iter() {
            if self.checkpoint() {
                return Ok(ScanOutcome::Aborted);
            }
            let region = &self.config.regions[unit.indices.region];

            if unit.starts_visit {
                if unit.indices.time_point == 0 {
                    region_started = Instant::now();
                } else if !self.wait_for_time_point(region_started, unit.indices.time_point) {
                    return Ok(ScanOutcome::Aborted);
                }
                self.hardware
                    .stage
                    .move_to(Some(region.x_mm), Some(region.y_mm), Some(region.z_mm))?;
                if !self.timing.stage_settle.is_zero() {
                    thread::sleep(self.timing.stage_settle);
                }
                focus_correction_um = self.autofocus(unit.indices.region, region)?;
            }

            if unit.starts_plane {
                let offset_um =
                    focus_correction_um + self.config.z_stack.offset_um(unit.indices.z_plane);
                plane_z_mm = region.z_mm + offset_um / 1000.0;
                self.hardware.stage.move_z_to(plane_z_mm)?;
            }

            self.capture(&unit, region, plane_z_mm)?;

            if let Some(progress) = tracker.record(unit.indices, &unit.label) {
                self.bus.publish(State::AcquisitionProgress(progress));
            }
        }

        Ok(ScanOutcome::Completed)
    }

    /// Honor stop and pause requests between units. Returns true to stop.
    fn checkpoint(&self) -> bool {
        if self.control.stop_requested() {
            tracing::info!("{} stopping at unit boundary", self.run_id);
            return true;
        }
        if !self.control.pause_requested() {
            return false;
        }

        tracing::info!("{} paused", self.run_id);
        self.bus.publish(State::AcquisitionPaused {
            run_id: self.run_id,
        });
        while self.control.pause_requested() {
            if self.control.stop_requested() {
                return true;
            }
            thread::sleep(self.timing.pause_poll);
        }
        if self.control.stop_requested() {
            return true;
        }
        tracing::info!("{} resumed", self.run_id);
        self.bus.publish(State::AcquisitionResumed {
            run_id: self.run_id,
        });
        false
    }

    /// Sleep until `region_started + t * interval`. Returns false on stop.
    fn wait_for_time_point(&self, region_started: Instant, time_point: u32) -> bool {
        let offset =
            Duration::from_secs_f64(self.config.time_series.interval_s * time_point as f64);
        let deadline = region_started + offset;

        let now = Instant::now();
        if now > deadline {
            if !offset.is_zero() {
                tracing::warn!(
                    "{} time point {} starts {:.3} s late",
                    self.run_id,
                    time_point,
                    (now - deadline).as_secs_f64()
                );
            }
            return true;
        }

        loop {
            if self.control.stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.timing.wait_slice));
        }
    }

    /// Run autofocus when due and return the correction to carry through
    /// the visit, in micrometers
    fn autofocus(&self, region_index: usize, region: &Region) -> DeviceResult<f64> {
        let plan = &self.config.autofocus;
        let Some(autofocus) = self.hardware.autofocus.as_ref() else {
            return Ok(0.0);
        };
        let stack = &self.config.z_stack;
        let due = plan.enabled
            && region_index % plan.every_n_regions.max(1) as usize == 0
            && (stack.planes == 1 || stack.anchor == ZAnchor::FromCenter);
        if !due {
            return Ok(0.0);
        }

        let correction = match autofocus.measure(region.z_mm) {
            Ok(correction) => correction,
            Err(e) => {
                tracing::warn!("Autofocus failed at {}: {}", region.name, e);
                None
            }
        };
        match correction {
            Some(c) => tracing::debug!("Autofocus at {} corrected {} um", region.name, c),
            None => tracing::warn!("No focus found at {}, keeping reference Z", region.name),
        }
        self.bus.publish(State::AutofocusCompleted {
            run_id: self.run_id,
            region: region_index,
            z_correction_um: correction,
        });
        Ok(correction.unwrap_or(0.0))
    }

    fn capture(&self, unit: &CaptureUnit, region: &Region, plane_z_mm: f64) -> DeviceResult<()> {
        let Some(lead) = unit.channels.first() else {
            return Ok(());
        };
        let hw = &self.hardware;

        let exposure_ms = unit
            .channels
            .iter()
            .map(|c| c.exposure_ms)
            .fold(f64::MIN, f64::max);
        let gain = unit
            .channels
            .iter()
            .map(|c| c.analog_gain)
            .fold(f64::MIN, f64::max);
        hw.camera.set_exposure_time(exposure_ms)?;
        hw.camera.set_analog_gain(gain)?;

        if let Some(position) = unit.channels.iter().find_map(|c| c.filter_position) {
            match hw.filter_wheel.as_ref() {
                Some(wheel) => {
                    wheel.set_position(position)?;
                }
                None => tracing::debug!(
                    "{} wants filter {} but no wheel is fitted",
                    unit.label,
                    position
                ),
            }
        }

        let z_offset_um = lead.z_offset_um;
        if z_offset_um != 0.0 {
            hw.stage.move_z_to(plane_z_mm + z_offset_um / 1000.0)?;
        }

        let captured = self.expose(unit);
        let darkened = self.darken(unit);
        let restored = if z_offset_um != 0.0 {
            hw.stage.move_z_to(plane_z_mm).map(|_| ())
        } else {
            Ok(())
        };
        let frame = captured?;
        darkened?;
        restored?;

        let metadata = FrameMetadata {
            run_id: Some(self.run_id),
            region: Some(region.name.clone()),
            indices: Some(unit.indices),
            channels: unit.channels.iter().map(|c| c.name.clone()).collect(),
            position: hw.stage.position().ok(),
            captured_at: Utc::now(),
        };
        hw.sink.deliver_frame(frame, metadata);
        Ok(())
    }

    /// Light the unit's sources in dispatch order and take one frame
    fn expose(&self, unit: &CaptureUnit) -> DeviceResult<Frame> {
        let mut previous_offset: Option<f64> = None;
        for channel in &unit.channels {
            if let Some(previous) = previous_offset {
                let delta_ms = channel.trigger_offset_ms - previous;
                if delta_ms > 0.0 {
                    thread::sleep(Duration::from_secs_f64(delta_ms / 1000.0));
                }
            }
            previous_offset = Some(channel.trigger_offset_ms);
            self.hardware
                .illumination
                .turn_on(channel.illumination_source, channel.intensity_percent)?;
        }
        self.hardware.camera.capture_frame()
    }

    /// Switch off every source the unit uses; keeps going past failures
    fn darken(&self, unit: &CaptureUnit) -> DeviceResult<()> {
        let mut first_error = None;
        for channel in &unit.channels {
            if let Err(e) = self
                .hardware
                .illumination
                .turn_off(channel.illumination_source)
            {
                tracing::error!("Failed to switch off {}: {}", channel.name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Return hardware to an idle-safe state. Returns whether that worked.
    fn cleanup(&self) -> bool {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut safe = true;
            if let Err(e) = self.hardware.illumination.all_off() {
                tracing::error!("{} cleanup: illumination still on: {}", self.run_id, e);
                safe = false;
            }
            if let Err(e) = self.hardware.camera.stop_streaming() {
                tracing::error!("{} cleanup: camera still streaming: {}", self.run_id, e);
                safe = false;
            }
            safe
        }));
        result.unwrap_or_else(|panic| {
            tracing::error!(
                "{} cleanup panicked: {}",
                self.run_id,
                panic_message(panic.as_ref())
            );
            false
        })
    }
}
