//! Live view controller
//!
//! Streams frames into a sink while the global mode is `Live`. An acquisition
//! started from live view takes the mode away; the live worker then idles
//! until the mode comes back to `Live` and picks up where it left off.
//!
//! Each frame is checked, captured and delivered under the camera session
//! lock, and mode changes that hand the camera to another workflow are made
//! under the same lock.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use scopekit_core::event_bus::{Command, Event, EventFilter, EventKind, State};
use scopekit_core::{GlobalMode, HardwareAction, SubscriptionId};
use scopekit_services::{
    CameraService, FrameMetadata, FrameSink, Service, ServiceContext, ServiceRegistry,
};

const NAME: &str = "live";

/// Name given to the live worker thread
pub const LIVE_THREAD_NAME: &str = "live-worker";

const POLL_SLICE: Duration = Duration::from_millis(20);
const MAX_CONSECUTIVE_FAULTS: u32 = 3;

/// Live view frame rates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    /// Rate used when `StartLive` carries none
    pub default_fps: f64,
    /// Upper bound for requested rates
    pub max_fps: f64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            default_fps: 10.0,
            max_fps: 30.0,
        }
    }
}

impl LiveSettings {
    fn effective_fps(&self, requested: Option<f64>) -> f64 {
        match requested {
            Some(fps) if fps.is_finite() && fps > 0.0 => fps.min(self.max_fps),
            _ => self.default_fps.min(self.max_fps),
        }
    }
}

#[derive(Debug)]
struct LiveShared {
    stop: AtomicBool,
    fps: Mutex<f64>,
}

#[derive(Default)]
struct LiveSlot {
    shared: Option<Arc<LiveShared>>,
    worker: Option<JoinHandle<()>>,
    suspended: bool,
}

/// Handles `StartLive` and `StopLive`
pub struct LiveController {
    ctx: ServiceContext,
    camera: Arc<CameraService>,
    sink: Arc<dyn FrameSink>,
    settings: LiveSettings,
    slot: Mutex<LiveSlot>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl LiveController {
    /// Create a controller streaming `camera` into `sink`
    pub fn new(
        camera: Arc<CameraService>,
        sink: Arc<dyn FrameSink>,
        ctx: ServiceContext,
        settings: LiveSettings,
    ) -> Self {
        Self {
            ctx,
            camera,
            sink,
            settings,
            slot: Mutex::new(LiveSlot::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Route live commands and mode changes to this controller
    pub fn attach(self: &Arc<Self>, registry: &ServiceRegistry) {
        registry.attach(self);

        let weak = Arc::downgrade(self);
        let id = self
            .ctx
            .bus()
            .subscribe_kind(EventKind::ModeChanged, move |event| {
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                if let Event::State(s) = event {
                    if let State::ModeChanged { old, new, .. } = &s.state {
                        controller.on_mode_changed(*old, *new);
                    }
                }
            });
        self.subscriptions.lock().push(id);
    }

    /// Stop streaming and detach from the bus
    pub fn shutdown(&self) {
        self.halt_worker();
        let ids = std::mem::take(&mut *self.subscriptions.lock());
        for id in ids {
            self.ctx.bus().unsubscribe(id);
        }
    }

    /// Whether a live worker exists (streaming or suspended)
    pub fn is_running(&self) -> bool {
        self.slot.lock().shared.is_some()
    }

    /// Whether live view is waiting for an acquisition to hand the mode back
    pub fn is_suspended(&self) -> bool {
        self.slot.lock().suspended
    }

    /// Current frame rate, when running
    pub fn fps(&self) -> Option<f64> {
        self.slot.lock().shared.as_ref().map(|s| *s.fps.lock())
    }

    /// Start live view, or change its rate when already running
    pub fn start(&self, fps: Option<f64>) -> bool {
        let fps = self.settings.effective_fps(fps);
        let gate = self.ctx.gate();

        let mut slot = self.slot.lock();
        if slot.worker.as_ref().is_some_and(|w| w.is_finished()) {
            // worker gave up after repeated faults
            slot.shared = None;
            slot.suspended = false;
            if let Some(worker) = slot.worker.take() {
                let _ = worker.join();
            }
        }
        if let Some(shared) = &slot.shared {
            *shared.fps.lock() = fps;
            drop(slot);
            tracing::info!("Live rate changed to {} fps", fps);
            self.ctx.publish(State::LiveStateChanged { active: true, fps });
            return true;
        }

        let mode = gate.get_mode();
        if mode != GlobalMode::Live
            && !gate.try_set_mode(GlobalMode::Idle, GlobalMode::Live, "live view started")
        {
            drop(slot);
            self.ctx.reject(
                NAME,
                EventKind::StartLive,
                format!("cannot start live view in {} mode", mode),
            );
            return false;
        }

        let shared = Arc::new(LiveShared {
            stop: AtomicBool::new(false),
            fps: Mutex::new(fps),
        });
        let worker = LiveWorker {
            ctx: self.ctx.clone(),
            camera: self.camera.clone(),
            sink: self.sink.clone(),
            shared: shared.clone(),
        };
        match thread::Builder::new()
            .name(LIVE_THREAD_NAME.to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                slot.shared = Some(shared);
                slot.worker = Some(handle);
                slot.suspended = false;
            }
            Err(e) => {
                drop(slot);
                tracing::error!("Failed to spawn live worker: {}", e);
                gate.try_set_mode(GlobalMode::Live, GlobalMode::Idle, "live view failed");
                self.ctx.publish(State::ServiceFault {
                    service: NAME.to_string(),
                    error: format!("failed to spawn live worker: {}", e),
                });
                return false;
            }
        }
        drop(slot);

        tracing::info!("Live view started at {} fps", fps);
        self.ctx.publish(State::LiveStateChanged { active: true, fps });
        true
    }

    /// Stop live view and return to `Idle`
    pub fn stop(&self) -> bool {
        let fps = self.halt_worker();
        self.ctx
            .gate()
            .try_set_mode(GlobalMode::Live, GlobalMode::Idle, "live view stopped");
        if !self.ctx.gate().blocked_for_hardware_commands() {
            if let Err(e) = self.camera.stop_streaming() {
                self.ctx.report_fault(NAME, &e);
            }
        }
        match fps {
            Some(fps) => {
                tracing::info!("Live view stopped");
                self.ctx.publish(State::LiveStateChanged { active: false, fps });
                true
            }
            None => false,
        }
    }

    fn halt_worker(&self) -> Option<f64> {
        let (shared, worker) = {
            let mut slot = self.slot.lock();
            slot.suspended = false;
            (slot.shared.take(), slot.worker.take())
        };
        let shared = shared?;
        shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Live worker thread panicked");
            }
        }
        let fps = *shared.fps.lock();
        Some(fps)
    }

    fn on_mode_changed(&self, old: GlobalMode, new: GlobalMode) {
        let fps = {
            let mut slot = self.slot.lock();
            let Some(shared) = &slot.shared else {
                return;
            };
            let fps = *shared.fps.lock();
            if old == GlobalMode::Live && new != GlobalMode::Live && !slot.suspended {
                slot.suspended = true;
                Some((false, fps))
            } else if new == GlobalMode::Live && slot.suspended {
                slot.suspended = false;
                Some((true, fps))
            } else {
                None
            }
        };
        if let Some((active, fps)) = fps {
            if active {
                tracing::info!("Live view resumed");
            } else {
                tracing::info!("Live view suspended while {}", new);
            }
            self.ctx.publish(State::LiveStateChanged { active, fps });
        }
    }
}

impl Service for LiveController {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[EventKind::StartLive, EventKind::StopLive]
    }

    fn handle_command(&self, command: &Command) {
        if !self.ctx.admit(NAME, command, HardwareAction::Streaming) {
            return;
        }
        match command {
            Command::StartLive { fps } => {
                self.start(*fps);
            }
            Command::StopLive => {
                self.stop();
            }
            _ => {}
        }
    }
}

impl Drop for LiveController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LiveWorker {
    ctx: ServiceContext,
    camera: Arc<CameraService>,
    sink: Arc<dyn FrameSink>,
    shared: Arc<LiveShared>,
}

impl LiveWorker {
    fn run(self) {
        let mut faults = 0u32;
        while !self.stopped() {
            let started = Instant::now();
            let captured = {
                let _session = self.camera.lock_session();
                if self.ctx.gate().get_mode() != GlobalMode::Live {
                    None
                } else {
                    let captured = self
                        .camera
                        .start_streaming()
                        .and_then(|_| self.camera.capture_frame())
                        .map(|frame| {
                            self.sink.deliver_frame(
                                frame,
                                FrameMetadata {
                                    run_id: None,
                                    region: None,
                                    indices: None,
                                    channels: Vec::new(),
                                    position: None,
                                    captured_at: Utc::now(),
                                },
                            )
                        });
                    Some(captured)
                }
            };
            match captured {
                None => {
                    thread::sleep(POLL_SLICE);
                    continue;
                }
                Some(Ok(())) => faults = 0,
                Some(Err(e)) => {
                    faults += 1;
                    self.ctx.report_fault(NAME, &e);
                    if faults >= MAX_CONSECUTIVE_FAULTS {
                        tracing::error!("Live view giving up after {} faults", faults);
                        self.ctx.gate().try_set_mode(
                            GlobalMode::Live,
                            GlobalMode::Idle,
                            "live view failed",
                        );
                        let fps = *self.shared.fps.lock();
                        self.ctx.publish(State::LiveStateChanged { active: false, fps });
                        return;
                    }
                }
            }

            let fps = *self.shared.fps.lock();
            let period = Duration::from_secs_f64(1.0 / fps);
            while !self.stopped() {
                let elapsed = started.elapsed();
                if elapsed >= period {
                    break;
                }
                thread::sleep((period - elapsed).min(POLL_SLICE));
            }
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopekit_core::{EventBus, GlobalModeGate};
    use scopekit_services::{CollectingSink, SimulatedCamera};

    #[test]
    fn test_requested_rate_is_bounded() {
        let settings = LiveSettings::default();
        assert_eq!(settings.effective_fps(None), 10.0);
        assert_eq!(settings.effective_fps(Some(120.0)), 30.0);
        assert_eq!(settings.effective_fps(Some(-1.0)), 10.0);
        assert_eq!(settings.effective_fps(Some(f64::NAN)), 10.0);
    }

    #[test]
    fn test_start_and_stop() {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let ctx = ServiceContext::new(bus, gate.clone());
        let camera = SimulatedCamera::new();
        let sink = Arc::new(CollectingSink::new());
        let live = LiveController::new(
            Arc::new(CameraService::new(camera.clone(), ctx.clone())),
            sink.clone(),
            ctx,
            LiveSettings {
                default_fps: 200.0,
                max_fps: 200.0,
            },
        );

        assert!(live.start(None));
        assert_eq!(gate.get_mode(), GlobalMode::Live);
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sink.len() >= 3);

        assert!(live.stop());
        assert_eq!(gate.get_mode(), GlobalMode::Idle);
        assert!(!camera.streaming());
        assert!(!live.is_running());
        assert!(!live.stop());
    }
}
