//! Acquisition controller
//!
//! Owns the acquisition state machine and the global mode while a run is in
//! flight. Commands arrive on the dispatch thread through the
//! [`Service`] contract; worker notifications arrive the same way, so every
//! state change is serialized through the bus.
//!
//! ```text
//! Idle -> Starting -> Running <-> Pausing -> Paused
//!            |           |                     |
//!            +-------> Aborting <--------------+
//!                        |
//! Running -> Completing -> Completed -> Idle
//!         \-----------------> Failed -> Idle
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use scopekit_core::data::{AcquisitionConfig, AcquisitionPhase, AcquisitionState};
use scopekit_core::event_bus::{Command, Event, EventFilter, EventKind, State};
use scopekit_core::{AcquisitionFinished, AcquisitionProgress, GlobalMode, RunId, SubscriptionId};
use scopekit_services::{Service, ServiceContext, ServiceRegistry};

use crate::worker::{
    AcquisitionHardware, AcquisitionTiming, AcquisitionWorker, WorkerControl, WORKER_THREAD_NAME,
};

const NAME: &str = "acquisition";

#[derive(Default)]
struct RunSlot {
    state: AcquisitionState,
    previous_mode: GlobalMode,
    config: Option<Arc<AcquisitionConfig>>,
    control: Option<Arc<WorkerControl>>,
    worker: Option<JoinHandle<()>>,
}

/// Starts, steers and finalizes acquisition runs
pub struct AcquisitionController {
    ctx: ServiceContext,
    hardware: AcquisitionHardware,
    timing: AcquisitionTiming,
    pause_enabled: bool,
    slot: Mutex<RunSlot>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl AcquisitionController {
    /// Create a controller driving `hardware`
    pub fn new(
        hardware: AcquisitionHardware,
        ctx: ServiceContext,
        timing: AcquisitionTiming,
    ) -> Self {
        Self {
            ctx,
            hardware,
            timing,
            pause_enabled: true,
            slot: Mutex::new(RunSlot::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Allow or refuse pause requests
    pub fn with_pause_enabled(mut self, enabled: bool) -> Self {
        self.pause_enabled = enabled;
        self
    }

    /// Route acquisition commands and worker notifications to this controller
    pub fn attach(self: &Arc<Self>, registry: &ServiceRegistry) {
        registry.attach(self);

        let weak = Arc::downgrade(self);
        let id = self.ctx.bus().subscribe(
            EventFilter::Kinds(vec![
                EventKind::AcquisitionWorkerReady,
                EventKind::AcquisitionProgress,
                EventKind::AcquisitionPaused,
                EventKind::AcquisitionResumed,
                EventKind::AcquisitionFinished,
            ]),
            move |event| {
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                if let Event::State(s) = event {
                    controller.on_worker_event(&s.state);
                }
            },
        );
        self.subscriptions.lock().push(id);
    }

    /// Stop any run, wait for its worker and detach from the bus
    pub fn shutdown(&self) {
        let (control, worker) = {
            let mut slot = self.slot.lock();
            (slot.control.clone(), slot.worker.take())
        };
        if let Some(control) = control {
            control.request_stop();
        }
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Acquisition worker thread panicked");
            }
        }
        let ids = std::mem::take(&mut *self.subscriptions.lock());
        for id in ids {
            self.ctx.bus().unsubscribe(id);
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> AcquisitionState {
        self.slot.lock().state.clone()
    }

    /// Run in progress, if any
    pub fn current_run(&self) -> Option<RunId> {
        self.slot.lock().state.run_id
    }

    /// Start a run. Returns the new run's ID, or `None` when refused.
    pub fn start(&self, config: AcquisitionConfig) -> Option<RunId> {
        if let Err(e) = config.validate() {
            self.reject(EventKind::StartAcquisition, format!("invalid configuration: {}", e));
            return None;
        }

        let run_id = RunId::new();
        let config = Arc::new(config.with_run_id(run_id));
        let totals = config.totals();
        let control = Arc::new(WorkerControl::default());

        let snapshot = {
            let mut slot = self.slot.lock();
            if slot.state.phase != AcquisitionPhase::Idle {
                let reason = format!("acquisition already {}", slot.state.phase);
                drop(slot);
                self.reject(EventKind::StartAcquisition, reason);
                return None;
            }
            let mode = self.ctx.gate().get_mode();
            if !matches!(mode, GlobalMode::Idle | GlobalMode::Live) {
                drop(slot);
                self.reject(
                    EventKind::StartAcquisition,
                    format!("cannot start an acquisition in {} mode", mode),
                );
                return None;
            }
            // no live frame may be in flight once the mode says Acquiring
            let taken = {
                let _camera = self.hardware.camera.lock_session();
                self.ctx
                    .gate()
                    .try_set_mode(mode, GlobalMode::Acquiring, "acquisition started")
            };
            if !taken {
                drop(slot);
                self.reject(EventKind::StartAcquisition, "mode changed during start");
                return None;
            }

            slot.previous_mode = mode;
            slot.state = AcquisitionState::starting(run_id, totals);
            slot.config = Some(config.clone());
            slot.control = Some(control.clone());
            slot.state.clone()
        };
        tracing::info!("Starting {} ({} units)", run_id, snapshot.totals.units);
        self.publish_snapshot(snapshot);

        let worker = AcquisitionWorker::new(
            run_id,
            config,
            self.hardware.clone(),
            control,
            self.ctx.bus().clone(),
            self.timing,
        );
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                let mut slot = self.slot.lock();
                if slot.state.run_id == Some(run_id) {
                    slot.worker = Some(handle);
                }
                Some(run_id)
            }
            Err(e) => {
                tracing::error!("Failed to spawn acquisition worker: {}", e);
                self.ctx.publish(State::AcquisitionFinished(AcquisitionFinished {
                    run_id,
                    success: false,
                    aborted: false,
                    error: Some(format!("failed to spawn worker: {}", e)),
                    hardware_safe: true,
                    units_done: 0,
                }));
                None
            }
        }
    }

    /// Ask the running worker to stop at the next unit boundary.
    ///
    /// Repeated requests while already aborting are accepted and ignored.
    pub fn stop(&self) -> bool {
        let snapshot = {
            let mut slot = self.slot.lock();
            let phase = slot.state.phase;
            if phase == AcquisitionPhase::Aborting {
                tracing::debug!("Stop already requested for {:?}", slot.state.run_id);
                return true;
            }
            if !phase.is_stoppable() {
                drop(slot);
                self.reject(
                    EventKind::StopAcquisition,
                    format!("no acquisition to stop ({})", phase),
                );
                return false;
            }
            if let Some(control) = &slot.control {
                control.request_stop();
            }
            slot.state.phase = AcquisitionPhase::Aborting;
            slot.state.clone()
        };
        tracing::info!("Stop requested for {:?}", snapshot.run_id);
        if let Err(e) = self
            .ctx
            .gate()
            .set_mode(GlobalMode::Aborting, "acquisition stop requested")
        {
            tracing::warn!("Could not enter Aborting mode: {}", e);
        }
        self.publish_snapshot(snapshot);
        true
    }

    /// Park the worker at the next unit boundary
    pub fn pause(&self) -> bool {
        if !self.pause_enabled {
            self.reject(EventKind::PauseAcquisition, "pausing is disabled");
            return false;
        }
        let snapshot = {
            let mut slot = self.slot.lock();
            if slot.state.phase != AcquisitionPhase::Running {
                let reason = format!("cannot pause while {}", slot.state.phase);
                drop(slot);
                self.reject(EventKind::PauseAcquisition, reason);
                return false;
            }
            if let Some(control) = &slot.control {
                control.set_paused(true);
            }
            slot.state.phase = AcquisitionPhase::Pausing;
            slot.state.clone()
        };
        self.publish_snapshot(snapshot);
        true
    }

    /// Release a paused (or pausing) worker
    pub fn resume(&self) -> bool {
        let snapshot = {
            let mut slot = self.slot.lock();
            if !matches!(
                slot.state.phase,
                AcquisitionPhase::Paused | AcquisitionPhase::Pausing
            ) {
                let reason = format!("cannot resume while {}", slot.state.phase);
                drop(slot);
                self.reject(EventKind::ResumeAcquisition, reason);
                return false;
            }
            if let Some(control) = &slot.control {
                control.set_paused(false);
            }
            slot.state.phase = AcquisitionPhase::Running;
            slot.state.clone()
        };
        self.publish_snapshot(snapshot);
        true
    }

    /// Leave `Error` mode once the operator has checked the hardware
    pub fn clear_error(&self) -> bool {
        let idle = self.slot.lock().state.phase == AcquisitionPhase::Idle;
        let mode = self.ctx.gate().get_mode();
        if mode != GlobalMode::Error || !idle {
            self.reject(
                EventKind::ClearError,
                format!("nothing to clear in {} mode", mode),
            );
            return false;
        }
        self.ctx
            .gate()
            .try_set_mode(GlobalMode::Error, GlobalMode::Idle, "error cleared")
    }

    fn on_worker_event(&self, state: &State) {
        match state {
            State::AcquisitionWorkerReady { run_id } => self.on_worker_ready(*run_id),
            State::AcquisitionProgress(progress) => self.on_progress(progress),
            State::AcquisitionPaused { run_id } => self.on_paused(*run_id),
            State::AcquisitionResumed { run_id } => {
                tracing::debug!("{} worker left pause", run_id);
            }
            State::AcquisitionFinished(finished) => self.on_finished(finished),
            _ => {}
        }
    }

    fn on_worker_ready(&self, run_id: RunId) {
        let (snapshot, config) = {
            let mut slot = self.slot.lock();
            if slot.state.run_id != Some(run_id) {
                tracing::debug!("Ignoring readiness of stale {}", run_id);
                return;
            }
            if slot.state.phase != AcquisitionPhase::Starting {
                return;
            }
            slot.state.phase = AcquisitionPhase::Running;
            (slot.state.clone(), slot.config.clone())
        };
        self.publish_snapshot(snapshot);
        if let Some(config) = config {
            self.ctx.publish(State::AcquisitionStarted {
                run_id,
                config: (*config).clone(),
            });
        }
    }

    fn on_progress(&self, progress: &AcquisitionProgress) {
        let mut slot = self.slot.lock();
        if slot.state.run_id != Some(progress.run_id) || !slot.state.phase.is_active() {
            tracing::debug!("Ignoring progress of stale {}", progress.run_id);
            return;
        }
        slot.state.indices = progress.indices;
        slot.state.units_done = progress.units_done;
        slot.state.eta_s = progress.eta_s;
    }

    fn on_paused(&self, run_id: RunId) {
        let snapshot = {
            let mut slot = self.slot.lock();
            if slot.state.run_id != Some(run_id) {
                tracing::debug!("Ignoring pause of stale {}", run_id);
                return;
            }
            if slot.state.phase != AcquisitionPhase::Pausing {
                return;
            }
            slot.state.phase = AcquisitionPhase::Paused;
            slot.state.clone()
        };
        self.publish_snapshot(snapshot);
    }

    fn on_finished(&self, finished: &AcquisitionFinished) {
        let (snapshots, worker, previous_mode) = {
            let mut slot = self.slot.lock();
            if slot.state.run_id != Some(finished.run_id) || !slot.state.phase.is_active() {
                tracing::debug!("Ignoring stale or duplicate finish of {}", finished.run_id);
                return;
            }
            let mut snapshots = Vec::with_capacity(2);
            if finished.success {
                if slot.state.phase != AcquisitionPhase::Aborting {
                    advance(&mut slot.state, AcquisitionPhase::Completing);
                    snapshots.push(slot.state.clone());
                }
                advance(&mut slot.state, AcquisitionPhase::Completed);
            } else {
                advance(&mut slot.state, AcquisitionPhase::Failed);
            }
            slot.state.units_done = finished.units_done;
            if finished.success {
                slot.state.eta_s = Some(0.0);
            }
            snapshots.push(slot.state.clone());
            slot.control = None;
            (snapshots, slot.worker.take(), slot.previous_mode)
        };

        match &finished.error {
            Some(error) => tracing::error!("{} failed: {}", finished.run_id, error),
            None if finished.aborted => tracing::info!("{} aborted", finished.run_id),
            None => tracing::info!("{} completed", finished.run_id),
        }
        for snapshot in snapshots {
            self.publish_snapshot(snapshot);
        }

        if finished.hardware_safe {
            self.ctx
                .gate()
                .restore_mode(previous_mode, "acquisition finished");
        } else if let Err(e) = self
            .ctx
            .gate()
            .set_mode(GlobalMode::Error, "hardware not safe after acquisition")
        {
            tracing::error!("Could not enter Error mode: {}", e);
        }

        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Acquisition worker thread panicked");
            }
        }

        let snapshot = {
            let mut slot = self.slot.lock();
            if slot.state.run_id != Some(finished.run_id) {
                return;
            }
            slot.state = AcquisitionState::default();
            slot.config = None;
            slot.state.clone()
        };
        self.publish_snapshot(snapshot);
    }

    fn reject(&self, command: EventKind, reason: impl Into<String>) {
        self.ctx.reject(NAME, command, reason);
    }

    fn publish_snapshot(&self, state: AcquisitionState) {
        tracing::debug!("Acquisition phase {}", state.phase);
        self.ctx.publish(State::AcquisitionStateChanged(state));
    }
}

fn advance(state: &mut AcquisitionState, next: AcquisitionPhase) {
    if !state.phase.can_transition_to(next) {
        tracing::warn!("Unexpected acquisition transition {} -> {}", state.phase, next);
    }
    state.phase = next;
}

impl Service for AcquisitionController {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[
            EventKind::StartAcquisition,
            EventKind::StopAcquisition,
            EventKind::PauseAcquisition,
            EventKind::ResumeAcquisition,
            EventKind::ClearError,
        ]
    }

    fn handle_command(&self, command: &Command) {
        match command {
            Command::StartAcquisition { config } => {
                self.start(config.clone());
            }
            Command::StopAcquisition => {
                self.stop();
            }
            Command::PauseAcquisition => {
                self.pause();
            }
            Command::ResumeAcquisition => {
                self.resume();
            }
            Command::ClearError => {
                self.clear_error();
            }
            _ => {}
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
