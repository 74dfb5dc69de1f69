//! Event type definitions for the event bus.
//!
//! Events are either a [`Command`] (intent, published by the UI or a
//! controller) or a [`StateEvent`] (fact, published by services, controllers
//! and workers). Events are plain data: cloneable and serializable for
//! logging/replay, and they never carry callables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{AcquisitionConfig, AcquisitionState, Axis, ScanIndices, ScanTotals};
use crate::mode::GlobalMode;
use crate::run::RunId;

/// Root event enum for all control-plane events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Intent to change something
    Command(Command),
    /// Notification that something changed
    State(StateEvent),
}

impl Event {
    /// Get the kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Command(c) => c.kind(),
            Event::State(s) => s.state.kind(),
        }
    }

    /// Correlation ID carried by the event, if any
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Event::Command(_) => None,
            Event::State(s) => s.run_id(),
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            Event::Command(c) => c.description(),
            Event::State(s) => s.state.description(),
        }
    }

    /// Borrow the command, if this is one
    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Event::Command(c) => Some(c),
            Event::State(_) => None,
        }
    }

    /// Borrow the state notification, if this is one
    pub fn as_state(&self) -> Option<&StateEvent> {
        match self {
            Event::Command(_) => None,
            Event::State(s) => Some(s),
        }
    }
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        Event::Command(command)
    }
}

impl From<State> for Event {
    fn from(state: State) -> Self {
        Event::State(StateEvent::new(state))
    }
}

/// Commands describing user or system intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Move one stage axis by a relative distance.
    MoveStage {
        /// Axis to move.
        axis: Axis,
        /// Signed distance in millimeters.
        distance_mm: f64,
    },
    /// Move the stage to an absolute position; absent axes stay put.
    MoveStageTo {
        /// Target X in millimeters.
        x_mm: Option<f64>,
        /// Target Y in millimeters.
        y_mm: Option<f64>,
        /// Target Z in millimeters.
        z_mm: Option<f64>,
    },
    /// Home all stage axes.
    HomeStage,
    /// Set camera exposure.
    SetExposureTime {
        /// Exposure in milliseconds.
        exposure_ms: f64,
    },
    /// Set camera analog gain.
    SetAnalogGain {
        /// Gain value.
        gain: f64,
    },
    /// Switch an illumination source.
    SetIllumination {
        /// Source identifier.
        source: u32,
        /// Intensity, 0-100.
        intensity_percent: f64,
        /// Whether the source should be on.
        on: bool,
    },
    /// Move the filter wheel.
    SetFilterPosition {
        /// Target slot, 1-based.
        position: u32,
    },
    /// Home the filter wheel.
    HomeFilterWheel,
    /// Start continuous live view.
    StartLive {
        /// Frame rate; the configured default when absent.
        fps: Option<f64>,
    },
    /// Stop live view.
    StopLive,
    /// Start a multi-dimensional acquisition.
    StartAcquisition {
        /// What to acquire.
        config: AcquisitionConfig,
    },
    /// Abort the running acquisition.
    StopAcquisition,
    /// Pause the running acquisition at the next unit boundary.
    PauseAcquisition,
    /// Resume a paused acquisition.
    ResumeAcquisition,
    /// Leave the error mode once the operator has dealt with the fault.
    ClearError,
}

impl Command {
    /// Get the kind of this command
    pub fn kind(&self) -> EventKind {
        match self {
            Command::MoveStage { .. } => EventKind::MoveStage,
            Command::MoveStageTo { .. } => EventKind::MoveStageTo,
            Command::HomeStage => EventKind::HomeStage,
            Command::SetExposureTime { .. } => EventKind::SetExposureTime,
            Command::SetAnalogGain { .. } => EventKind::SetAnalogGain,
            Command::SetIllumination { .. } => EventKind::SetIllumination,
            Command::SetFilterPosition { .. } => EventKind::SetFilterPosition,
            Command::HomeFilterWheel => EventKind::HomeFilterWheel,
            Command::StartLive { .. } => EventKind::StartLive,
            Command::StopLive => EventKind::StopLive,
            Command::StartAcquisition { .. } => EventKind::StartAcquisition,
            Command::StopAcquisition => EventKind::StopAcquisition,
            Command::PauseAcquisition => EventKind::PauseAcquisition,
            Command::ResumeAcquisition => EventKind::ResumeAcquisition,
            Command::ClearError => EventKind::ClearError,
        }
    }

    fn description(&self) -> String {
        match self {
            Command::MoveStage { axis, distance_mm } => {
                format!("Move {} by {:.4} mm", axis, distance_mm)
            }
            Command::MoveStageTo { x_mm, y_mm, z_mm } => {
                format!("Move to X{:?} Y{:?} Z{:?}", x_mm, y_mm, z_mm)
            }
            Command::HomeStage => "Home stage".to_string(),
            Command::SetExposureTime { exposure_ms } => {
                format!("Set exposure {} ms", exposure_ms)
            }
            Command::SetAnalogGain { gain } => format!("Set gain {}", gain),
            Command::SetIllumination {
                source,
                intensity_percent,
                on,
            } => format!(
                "Illumination {} {} @ {}%",
                source,
                if *on { "on" } else { "off" },
                intensity_percent
            ),
            Command::SetFilterPosition { position } => format!("Filter -> {}", position),
            Command::HomeFilterWheel => "Home filter wheel".to_string(),
            Command::StartLive { fps } => format!("Start live ({:?} fps)", fps),
            Command::StopLive => "Stop live".to_string(),
            Command::StartAcquisition { config } => format!(
                "Start acquisition ({} regions, {} units)",
                config.regions.len(),
                config.totals().units
            ),
            Command::StopAcquisition => "Stop acquisition".to_string(),
            Command::PauseAcquisition => "Pause acquisition".to_string(),
            Command::ResumeAcquisition => "Resume acquisition".to_string(),
            Command::ClearError => "Clear error".to_string(),
        }
    }
}

/// A state notification with its emission time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    /// When the notification was created
    pub timestamp: DateTime<Utc>,
    /// What changed
    pub state: State,
}

impl StateEvent {
    /// Stamp a state notification with the current time
    pub fn new(state: State) -> Self {
        Self {
            timestamp: Utc::now(),
            state,
        }
    }

    /// Correlation ID carried by the notification, if any
    pub fn run_id(&self) -> Option<RunId> {
        match &self.state {
            State::AcquisitionStateChanged(snapshot) => snapshot.run_id,
            State::AcquisitionWorkerReady { run_id }
            | State::AcquisitionStarted { run_id, .. }
            | State::AcquisitionPaused { run_id }
            | State::AcquisitionResumed { run_id }
            | State::AutofocusCompleted { run_id, .. } => Some(*run_id),
            State::AcquisitionProgress(p) => Some(p.run_id),
            State::AcquisitionFinished(f) => Some(f.run_id),
            _ => None,
        }
    }
}

/// Progress report published by the acquisition worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionProgress {
    /// Run the report belongs to
    pub run_id: RunId,
    /// Scan position of the last completed unit
    pub indices: ScanIndices,
    /// Scan dimensions
    pub totals: ScanTotals,
    /// Units completed
    pub units_done: u64,
    /// Units in the run
    pub units_total: u64,
    /// Completion percentage, 0-100
    pub percent: f64,
    /// Estimated seconds remaining
    pub eta_s: Option<f64>,
    /// Channel (or simultaneous group) of the last completed unit
    pub channel: String,
}

/// Terminal report published exactly once per run by the acquisition worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionFinished {
    /// Run the report belongs to
    pub run_id: RunId,
    /// All units were captured without error
    pub success: bool,
    /// The run ended because of a stop request
    pub aborted: bool,
    /// Error description when the run failed
    pub error: Option<String>,
    /// Cleanup restored hardware to an idle-safe state
    pub hardware_safe: bool,
    /// Units completed before the run ended
    pub units_done: u64,
}

/// State notifications describing facts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    /// Global mode changed.
    ModeChanged {
        /// Previous mode.
        old: GlobalMode,
        /// New mode.
        new: GlobalMode,
        /// Why the mode changed.
        reason: String,
    },
    /// A command was refused without touching hardware.
    CommandRejected {
        /// The refused command.
        command: EventKind,
        /// Why it was refused.
        reason: String,
    },
    /// A service operation hit a device fault.
    ServiceFault {
        /// Service name.
        service: String,
        /// Fault description.
        error: String,
    },
    /// Stage position changed.
    StagePositionChanged {
        /// X in millimeters.
        x_mm: f64,
        /// Y in millimeters.
        y_mm: f64,
        /// Z in millimeters.
        z_mm: f64,
    },
    /// Camera exposure changed.
    ExposureTimeChanged {
        /// Exposure in milliseconds.
        exposure_ms: f64,
    },
    /// Camera gain changed.
    AnalogGainChanged {
        /// Gain value.
        gain: f64,
    },
    /// Camera streaming started or stopped.
    StreamingChanged {
        /// Whether the camera is streaming.
        streaming: bool,
    },
    /// Illumination source state changed.
    IlluminationChanged {
        /// Source identifier.
        source: u32,
        /// Intensity, 0-100.
        intensity_percent: f64,
        /// Whether the source is on.
        on: bool,
    },
    /// Filter wheel position changed.
    FilterPositionChanged {
        /// Slot, 1-based.
        position: u32,
    },
    /// Live view started, stopped, or was suspended.
    LiveStateChanged {
        /// Whether frames are being streamed.
        active: bool,
        /// Frame rate.
        fps: f64,
    },
    /// Acquisition controller state snapshot.
    AcquisitionStateChanged(AcquisitionState),
    /// The acquisition worker thread is up and about to capture.
    AcquisitionWorkerReady {
        /// Run the worker belongs to.
        run_id: RunId,
    },
    /// A run started.
    AcquisitionStarted {
        /// Run identifier.
        run_id: RunId,
        /// Immutable configuration of the run.
        config: AcquisitionConfig,
    },
    /// Rate-limited run progress.
    AcquisitionProgress(AcquisitionProgress),
    /// Worker parked at a unit boundary.
    AcquisitionPaused {
        /// Run identifier.
        run_id: RunId,
    },
    /// Worker left the pause.
    AcquisitionResumed {
        /// Run identifier.
        run_id: RunId,
    },
    /// Autofocus ran at a region during a run.
    AutofocusCompleted {
        /// Run identifier.
        run_id: RunId,
        /// Region index.
        region: usize,
        /// Applied Z correction in micrometers, when focus was found.
        z_correction_um: Option<f64>,
    },
    /// A run ended.
    AcquisitionFinished(AcquisitionFinished),
}

impl State {
    /// Get the kind of this notification
    pub fn kind(&self) -> EventKind {
        match self {
            State::ModeChanged { .. } => EventKind::ModeChanged,
            State::CommandRejected { .. } => EventKind::CommandRejected,
            State::ServiceFault { .. } => EventKind::ServiceFault,
            State::StagePositionChanged { .. } => EventKind::StagePositionChanged,
            State::ExposureTimeChanged { .. } => EventKind::ExposureTimeChanged,
            State::AnalogGainChanged { .. } => EventKind::AnalogGainChanged,
            State::StreamingChanged { .. } => EventKind::StreamingChanged,
            State::IlluminationChanged { .. } => EventKind::IlluminationChanged,
            State::FilterPositionChanged { .. } => EventKind::FilterPositionChanged,
            State::LiveStateChanged { .. } => EventKind::LiveStateChanged,
            State::AcquisitionStateChanged(_) => EventKind::AcquisitionStateChanged,
            State::AcquisitionWorkerReady { .. } => EventKind::AcquisitionWorkerReady,
            State::AcquisitionStarted { .. } => EventKind::AcquisitionStarted,
            State::AcquisitionProgress(_) => EventKind::AcquisitionProgress,
            State::AcquisitionPaused { .. } => EventKind::AcquisitionPaused,
            State::AcquisitionResumed { .. } => EventKind::AcquisitionResumed,
            State::AutofocusCompleted { .. } => EventKind::AutofocusCompleted,
            State::AcquisitionFinished(_) => EventKind::AcquisitionFinished,
        }
    }

    fn description(&self) -> String {
        match self {
            State::ModeChanged { old, new, reason } => {
                format!("Mode: {} -> {} ({})", old, new, reason)
            }
            State::CommandRejected { command, reason } => {
                format!("Rejected {}: {}", command, reason)
            }
            State::ServiceFault { service, error } => format!("{} fault: {}", service, error),
            State::StagePositionChanged { x_mm, y_mm, z_mm } => {
                format!("Position: X{:.4} Y{:.4} Z{:.4}", x_mm, y_mm, z_mm)
            }
            State::ExposureTimeChanged { exposure_ms } => format!("Exposure: {} ms", exposure_ms),
            State::AnalogGainChanged { gain } => format!("Gain: {}", gain),
            State::StreamingChanged { streaming } => format!("Streaming: {}", streaming),
            State::IlluminationChanged {
                source,
                intensity_percent,
                on,
            } => format!(
                "Illumination {}: {} @ {}%",
                source,
                if *on { "on" } else { "off" },
                intensity_percent
            ),
            State::FilterPositionChanged { position } => format!("Filter: {}", position),
            State::LiveStateChanged { active, fps } => {
                format!("Live: {} @ {} fps", active, fps)
            }
            State::AcquisitionStateChanged(s) => match s.run_id {
                Some(run_id) => format!("Acquisition {}: {}", run_id, s.phase),
                None => format!("Acquisition: {}", s.phase),
            },
            State::AcquisitionWorkerReady { run_id } => format!("Worker ready: {}", run_id),
            State::AcquisitionStarted { run_id, .. } => format!("Acquisition started: {}", run_id),
            State::AcquisitionProgress(p) => format!(
                "Progress {}: {}/{} ({:.1}%)",
                p.run_id, p.units_done, p.units_total, p.percent
            ),
            State::AcquisitionPaused { run_id } => format!("Paused: {}", run_id),
            State::AcquisitionResumed { run_id } => format!("Resumed: {}", run_id),
            State::AutofocusCompleted {
                run_id,
                region,
                z_correction_um,
            } => format!(
                "Autofocus {} region {}: {:?} um",
                run_id, region, z_correction_um
            ),
            State::AcquisitionFinished(f) => format!(
                "Acquisition finished: {} (success={}, aborted={})",
                f.run_id, f.success, f.aborted
            ),
        }
    }
}

/// Event kind used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// [`Command::MoveStage`]
    MoveStage,
    /// [`Command::MoveStageTo`]
    MoveStageTo,
    /// [`Command::HomeStage`]
    HomeStage,
    /// [`Command::SetExposureTime`]
    SetExposureTime,
    /// [`Command::SetAnalogGain`]
    SetAnalogGain,
    /// [`Command::SetIllumination`]
    SetIllumination,
    /// [`Command::SetFilterPosition`]
    SetFilterPosition,
    /// [`Command::HomeFilterWheel`]
    HomeFilterWheel,
    /// [`Command::StartLive`]
    StartLive,
    /// [`Command::StopLive`]
    StopLive,
    /// [`Command::StartAcquisition`]
    StartAcquisition,
    /// [`Command::StopAcquisition`]
    StopAcquisition,
    /// [`Command::PauseAcquisition`]
    PauseAcquisition,
    /// [`Command::ResumeAcquisition`]
    ResumeAcquisition,
    /// [`Command::ClearError`]
    ClearError,
    /// [`State::ModeChanged`]
    ModeChanged,
    /// [`State::CommandRejected`]
    CommandRejected,
    /// [`State::ServiceFault`]
    ServiceFault,
    /// [`State::StagePositionChanged`]
    StagePositionChanged,
    /// [`State::ExposureTimeChanged`]
    ExposureTimeChanged,
    /// [`State::AnalogGainChanged`]
    AnalogGainChanged,
    /// [`State::StreamingChanged`]
    StreamingChanged,
    /// [`State::IlluminationChanged`]
    IlluminationChanged,
    /// [`State::FilterPositionChanged`]
    FilterPositionChanged,
    /// [`State::LiveStateChanged`]
    LiveStateChanged,
    /// [`State::AcquisitionStateChanged`]
    AcquisitionStateChanged,
    /// [`State::AcquisitionWorkerReady`]
    AcquisitionWorkerReady,
    /// [`State::AcquisitionStarted`]
    AcquisitionStarted,
    /// [`State::AcquisitionProgress`]
    AcquisitionProgress,
    /// [`State::AcquisitionPaused`]
    AcquisitionPaused,
    /// [`State::AcquisitionResumed`]
    AcquisitionResumed,
    /// [`State::AutofocusCompleted`]
    AutofocusCompleted,
    /// [`State::AcquisitionFinished`]
    AcquisitionFinished,
}

impl EventKind {
    /// Whether this kind names a command
    pub fn is_command(self) -> bool {
        matches!(
            self,
            EventKind::MoveStage
                | EventKind::MoveStageTo
                | EventKind::HomeStage
                | EventKind::SetExposureTime
                | EventKind::SetAnalogGain
                | EventKind::SetIllumination
                | EventKind::SetFilterPosition
                | EventKind::HomeFilterWheel
                | EventKind::StartLive
                | EventKind::StopLive
                | EventKind::StartAcquisition
                | EventKind::StopAcquisition
                | EventKind::PauseAcquisition
                | EventKind::ResumeAcquisition
                | EventKind::ClearError
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_categories() {
        let cmd: Event = Command::MoveStage {
            axis: Axis::X,
            distance_mm: 0.5,
        }
        .into();
        assert_eq!(cmd.kind(), EventKind::MoveStage);
        assert!(cmd.kind().is_command());
        assert!(cmd.as_command().is_some());
        assert!(cmd.run_id().is_none());

        let state: Event = State::FilterPositionChanged { position: 3 }.into();
        assert_eq!(state.kind(), EventKind::FilterPositionChanged);
        assert!(!state.kind().is_command());
        assert!(state.as_state().is_some());
    }

    #[test]
    fn test_run_id_extraction() {
        let run_id = RunId::new();
        let event: Event = State::AcquisitionPaused { run_id }.into();
        assert_eq!(event.run_id(), Some(run_id));

        let event: Event = State::AcquisitionFinished(AcquisitionFinished {
            run_id,
            success: true,
            aborted: false,
            error: None,
            hardware_safe: true,
            units_done: 6,
        })
        .into();
        assert_eq!(event.run_id(), Some(run_id));
    }

    #[test]
    fn test_events_serialize() {
        let event: Event = State::ModeChanged {
            old: GlobalMode::Idle,
            new: GlobalMode::Acquiring,
            reason: "acquisition start".to_string(),
        }
        .into();
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind(), EventKind::ModeChanged);
        assert!(back.description().contains("Idle -> Acquiring"));
    }
}
