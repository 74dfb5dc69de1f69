//! # ScopeKit Services
//!
//! One service per hardware resource. A service owns its device behind its
//! own lock, clamps inputs, performs the call, and publishes the resulting
//! state only after the lock is released. Command handlers consult the
//! global mode gate; direct method calls from the workflow that owns the
//! mode are not gated.

pub mod autofocus;
pub mod camera;
pub mod filter_wheel;
pub mod hardware;
pub mod illumination;
pub mod service;
pub mod sim;
pub mod stage;

pub use autofocus::AutofocusService;
pub use camera::CameraService;
pub use filter_wheel::FilterWheelService;
pub use hardware::{
    Camera, CollectingSink, DeviceResult, FilterWheel, FocusDevice, Frame, FrameMetadata,
    FrameSink, Illumination, NullSink, Stage, StageLimits,
};
pub use illumination::IlluminationService;
pub use service::{Service, ServiceContext, ServiceRegistry};
pub use sim::{
    FaultInjector, SimulatedCamera, SimulatedFilterWheel, SimulatedFocus, SimulatedIllumination,
    SimulatedStage,
};
pub use stage::StageService;
