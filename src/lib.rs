//! # ScopeKit
//!
//! Control-plane engine for automated microscopes:
//! - Queued event bus with a single dispatch thread and a UI-thread facade
//! - Global mode gate arbitrating which workflow owns the hardware
//! - Multi-dimensional acquisition (regions, time points, z-stacks, channel
//!   groups) with pause, stop and run correlation
//! - Live view that yields to acquisitions
//!
//! ## Architecture
//!
//! ScopeKit is organized as a workspace with multiple crates:
//!
//! 1. **scopekit-core** - Event bus, events, mode gate, run IDs, data model
//! 2. **scopekit-services** - Device traits, hardware services, simulators
//! 3. **scopekit-acquisition** - Acquisition and live view controllers
//! 4. **scopekit-settings** - Engine settings files
//! 5. **scopekit** - Assembly, logging setup and the headless demo binary

use std::sync::Arc;
use std::time::Duration;

pub use scopekit_acquisition;
pub use scopekit_core;
pub use scopekit_services;
pub use scopekit_settings;

use scopekit_acquisition::{AcquisitionController, AcquisitionHardware, LiveController};
use scopekit_core::{EventBus, GlobalModeGate};
use scopekit_services::{
    CameraService, FilterWheelService, FrameSink, IlluminationService, ServiceContext,
    ServiceRegistry, SimulatedCamera, SimulatedFilterWheel, SimulatedIllumination, SimulatedStage,
    StageService,
};
use scopekit_settings::{EngineSettings, LoggingSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging from the logging settings
///
/// Sets up structured logging with:
/// - `RUST_LOG` support, falling back to the configured directive
/// - Targets, levels, thread ids and thread names on every line
/// - Optional JSON output
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.directive))?;

    let (plain, json) = if settings.json {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .try_init()?;

    Ok(())
}

/// Handles on the simulated devices behind a [`ControlPlane::simulated`]
#[derive(Debug, Clone)]
pub struct SimulatedDevices {
    /// Stage
    pub stage: SimulatedStage,
    /// Camera
    pub camera: SimulatedCamera,
    /// Light engine
    pub illumination: SimulatedIllumination,
    /// Filter wheel
    pub filter_wheel: SimulatedFilterWheel,
}

/// A wired-up engine: bus, gate, hardware services and controllers
pub struct ControlPlane {
    /// Event bus
    pub bus: Arc<EventBus>,
    /// Global mode gate
    pub gate: Arc<GlobalModeGate>,
    /// Hardware services shared with the acquisition worker
    pub hardware: AcquisitionHardware,
    /// Acquisition controller
    pub acquisition: Arc<AcquisitionController>,
    /// Live view controller
    pub live: Arc<LiveController>,
    registry: ServiceRegistry,
}

impl ControlPlane {
    /// Wire up an engine around hardware services built by `build`
    pub fn assemble<F>(settings: &EngineSettings, build: F) -> Self
    where
        F: FnOnce(&ServiceContext) -> AcquisitionHardware,
    {
        let bus = Arc::new(EventBus::with_config(settings.bus_config()));
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let ctx = ServiceContext::new(bus.clone(), gate.clone());
        let hardware = build(&ctx);

        let registry = ServiceRegistry::new(bus.clone());
        registry.attach(&hardware.stage);
        registry.attach(&hardware.camera);
        registry.attach(&hardware.illumination);
        if let Some(wheel) = &hardware.filter_wheel {
            registry.attach(wheel);
        }

        let acquisition = Arc::new(
            AcquisitionController::new(hardware.clone(), ctx.clone(), settings.acquisition_timing())
                .with_pause_enabled(settings.acquisition.pause_enabled),
        );
        acquisition.attach(&registry);

        let live = Arc::new(LiveController::new(
            hardware.camera.clone(),
            hardware.sink.clone(),
            ctx,
            settings.live_settings(),
        ));
        live.attach(&registry);

        tracing::info!("Control plane ready: {}", registry.services().join(", "));
        Self {
            bus,
            gate,
            hardware,
            acquisition,
            live,
            registry,
        }
    }

    /// Engine on simulated devices, for demos and tests
    pub fn simulated(
        settings: &EngineSettings,
        sink: Arc<dyn FrameSink>,
    ) -> (Self, SimulatedDevices) {
        let devices = SimulatedDevices {
            stage: SimulatedStage::new(),
            camera: SimulatedCamera::new(),
            illumination: SimulatedIllumination::default(),
            filter_wheel: SimulatedFilterWheel::new(6),
        };
        let handles = devices.clone();
        let plane = Self::assemble(settings, move |ctx| AcquisitionHardware {
            stage: Arc::new(StageService::new(devices.stage, ctx.clone())),
            camera: Arc::new(CameraService::new(devices.camera, ctx.clone())),
            illumination: Arc::new(IlluminationService::new(devices.illumination, ctx.clone())),
            filter_wheel: Some(Arc::new(FilterWheelService::new(
                devices.filter_wheel,
                ctx.clone(),
            ))),
            autofocus: None,
            sink,
        });
        (plane, handles)
    }

    /// Names of the services attached to the bus
    pub fn services(&self) -> Vec<&'static str> {
        self.registry.services()
    }

    /// Stop workers, detach everything and stop the dispatch thread
    pub fn shutdown(&self) {
        self.live.shutdown();
        self.acquisition.shutdown();
        self.registry.shutdown();
        if !self.bus.flush(Duration::from_secs(1)) {
            let dropped = self.bus.clear();
            tracing::warn!("Event queue not drained at shutdown, dropped {} events", dropped);
        }
        self.bus.stop();
        tracing::info!("Control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopekit_core::data::{ChannelGroup, ChannelSpec, Region};
    use scopekit_core::{AcquisitionConfig, AcquisitionPhase, Command, GlobalMode};
    use scopekit_services::CollectingSink;
    use std::time::Instant;

    #[test]
    fn test_simulated_plane_runs_an_acquisition() {
        let sink = Arc::new(CollectingSink::new());
        let (plane, devices) = ControlPlane::simulated(&EngineSettings::default(), sink.clone());
        assert_eq!(
            plane.services(),
            vec!["stage", "camera", "illumination", "filter wheel", "acquisition", "live"]
        );

        let config = AcquisitionConfig::new(
            vec![Region::new("A1", 5.0, 5.0, 1.0)],
            vec![ChannelGroup::sequential(
                "fluo",
                vec![ChannelSpec::new("GFP", 5.0, 488, 30.0).with_filter(3)],
            )],
        );
        plane.bus.publish(Command::StartAcquisition { config });

        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.is_empty() || plane.acquisition.state().phase != AcquisitionPhase::Idle {
            assert!(Instant::now() < deadline, "acquisition did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(plane.bus.flush(Duration::from_secs(5)));
        assert_eq!(plane.gate.get_mode(), GlobalMode::Idle);
        assert_eq!(devices.filter_wheel.current(), 3);

        plane.shutdown();
        assert!(!plane.bus.is_running());
    }
}
