//! # ScopeKit Acquisition
//!
//! Workflow controllers for the ScopeKit control plane:
//!
//! - [`AcquisitionController`]: the acquisition state machine, run lifecycle
//!   and global mode ownership
//! - [`AcquisitionWorker`]: the thread that walks a [`ScanPlan`] and drives
//!   the hardware services
//! - [`LiveController`]: continuous live view, suspended while an
//!   acquisition holds the hardware

pub mod controller;
pub mod live;
pub mod plan;
pub mod progress;
pub mod worker;

pub use controller::AcquisitionController;
pub use live::{LiveController, LiveSettings, LIVE_THREAD_NAME};
pub use plan::{CaptureUnit, ScanPlan, ScanUnits};
pub use progress::ProgressTracker;
pub use worker::{
    AcquisitionHardware, AcquisitionTiming, AcquisitionWorker, WorkerControl, WORKER_THREAD_NAME,
};
