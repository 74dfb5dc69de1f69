//! # ScopeKit Core
//!
//! Core types for the ScopeKit control plane.
//! Provides the queued event bus, the UI-thread bus facade, the global mode
//! gate, run correlation IDs and the acquisition data model.

pub mod data;
pub mod error;
pub mod event_bus;
pub mod mode;
pub mod run;

pub use data::{
    AcquisitionConfig, AcquisitionPhase, AcquisitionState, Axis, ChannelGroup, ChannelSpec,
    Region, ScanIndices, ScanTotals, StagePosition,
};

pub use error::{ConfigError, Error, EventBusError, HardwareError, ModeError, Result};

// Re-export event bus for convenience
pub use event_bus::{
    AcquisitionFinished, AcquisitionProgress, Command, Event, EventBus, EventBusConfig,
    EventFilter, EventKind, State, StateEvent, SubscriptionId, UiDispatcher, UiEventBus,
};

pub use mode::{GlobalMode, GlobalModeGate, HardwareAction};
pub use run::{RunFilter, RunId};
