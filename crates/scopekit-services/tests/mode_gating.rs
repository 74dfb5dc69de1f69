//! Command-path gating against the global mode.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use scopekit_core::data::{Axis, StagePosition};
use scopekit_core::{Command, EventBus, EventKind, GlobalMode, GlobalModeGate, State};
use scopekit_services::{
    Camera, CameraService, IlluminationService, ServiceContext, ServiceRegistry, SimulatedCamera,
    SimulatedIllumination, SimulatedStage, StageService,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    bus: Arc<EventBus>,
    gate: Arc<GlobalModeGate>,
    stage: SimulatedStage,
    light: SimulatedIllumination,
    camera: SimulatedCamera,
    stage_service: Arc<StageService>,
    _illumination: Arc<IlluminationService>,
    _camera: Arc<CameraService>,
    _registry: ServiceRegistry,
    rejected: Arc<Mutex<Vec<EventKind>>>,
}

fn rig() -> Rig {
    let bus = Arc::new(EventBus::new());
    let gate = Arc::new(GlobalModeGate::new(bus.clone()));
    let ctx = ServiceContext::new(bus.clone(), gate.clone());

    let stage = SimulatedStage::new();
    let light = SimulatedIllumination::default();
    let stage_service = Arc::new(StageService::new(stage.clone(), ctx.clone()));
    let illumination = Arc::new(IlluminationService::new(light.clone(), ctx.clone()));
    let camera = SimulatedCamera::new();
    let camera_service = Arc::new(CameraService::new(camera.clone(), ctx));

    let registry = ServiceRegistry::new(bus.clone());
    registry.attach(&stage_service);
    registry.attach(&illumination);
    registry.attach(&camera_service);

    let rejected = Arc::new(Mutex::new(Vec::new()));
    let sink = rejected.clone();
    bus.subscribe_kind(EventKind::CommandRejected, move |event| {
        if let Some(s) = event.as_state() {
            if let State::CommandRejected { command, .. } = &s.state {
                sink.lock().push(*command);
            }
        }
    });

    Rig {
        bus,
        gate,
        stage,
        light,
        camera,
        stage_service,
        _illumination: illumination,
        _camera: camera_service,
        _registry: registry,
        rejected,
    }
}

#[test]
fn move_stage_is_ignored_while_acquiring() {
    let rig = rig();

    rig.bus.publish(Command::MoveStage {
        axis: Axis::X,
        distance_mm: 1.0,
    });
    assert!(rig.bus.flush(WAIT));
    assert_eq!(rig.stage.current().x_mm, 1.0);

    rig.gate.set_mode(GlobalMode::Acquiring, "acquisition").unwrap();
    rig.bus.publish(Command::MoveStage {
        axis: Axis::X,
        distance_mm: 5.0,
    });
    rig.bus.publish(Command::SetIllumination {
        source: 488,
        intensity_percent: 50.0,
        on: true,
    });
    assert!(rig.bus.flush(WAIT));
    assert_eq!(rig.stage.current().x_mm, 1.0);
    assert!(!rig.light.any_on());
    assert_eq!(
        *rig.rejected.lock(),
        vec![EventKind::MoveStage, EventKind::SetIllumination]
    );

    // The owning workflow still drives hardware directly.
    rig.stage_service.move_to(Some(7.0), None, None).unwrap();
    assert_eq!(rig.stage.current().x_mm, 7.0);

    rig.gate.set_mode(GlobalMode::Aborting, "stop").unwrap();
    rig.gate.set_mode(GlobalMode::Idle, "done").unwrap();
    rig.bus.publish(Command::MoveStage {
        axis: Axis::X,
        distance_mm: 1.0,
    });
    assert!(rig.bus.flush(WAIT));
    assert_eq!(rig.stage.current(), StagePosition::new(8.0, 0.0, 0.0));
}

#[test]
fn command_faults_are_published_not_raised() {
    let rig = rig();
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = faults.clone();
    rig.bus.subscribe_kind(EventKind::ServiceFault, move |event| {
        if let Some(s) = event.as_state() {
            if let State::ServiceFault { service, .. } = &s.state {
                sink.lock().push(service.clone());
            }
        }
    });

    rig.stage.faults().fail_after(0, "limit switch tripped");
    rig.bus.publish(Command::HomeStage);
    rig.bus.publish(Command::MoveStage {
        axis: Axis::Y,
        distance_mm: 2.0,
    });
    assert!(rig.bus.flush(WAIT));

    assert_eq!(*faults.lock(), vec!["stage".to_string()]);
    assert_eq!(rig.stage.current().y_mm, 2.0);
}

#[test]
fn non_finite_commands_are_rejected_before_hardware() {
    let rig = rig();
    let faults = Arc::new(Mutex::new(0usize));
    let count = faults.clone();
    rig.bus.subscribe_kind(EventKind::ServiceFault, move |_| *count.lock() += 1);

    let exposure = rig.camera.exposure();
    rig.bus.publish(Command::MoveStage {
        axis: Axis::Z,
        distance_mm: f64::NAN,
    });
    rig.bus.publish(Command::MoveStageTo {
        x_mm: Some(f64::INFINITY),
        y_mm: None,
        z_mm: None,
    });
    rig.bus.publish(Command::SetExposureTime {
        exposure_ms: f64::NAN,
    });
    rig.bus.publish(Command::SetAnalogGain {
        gain: f64::NEG_INFINITY,
    });
    rig.bus.publish(Command::SetIllumination {
        source: 488,
        intensity_percent: f64::NAN,
        on: true,
    });
    assert!(rig.bus.flush(WAIT));

    assert_eq!(
        *rig.rejected.lock(),
        vec![
            EventKind::MoveStage,
            EventKind::MoveStageTo,
            EventKind::SetExposureTime,
            EventKind::SetAnalogGain,
            EventKind::SetIllumination,
        ]
    );
    assert_eq!(*faults.lock(), 0);
    assert_eq!(rig.stage.current(), StagePosition::new(0.0, 0.0, 0.0));
    assert!(rig.stage.moves().is_empty());
    assert_eq!(rig.camera.exposure(), exposure);
    assert!(!rig.light.any_on());
    assert_eq!(rig.gate.get_mode(), GlobalMode::Idle);
}
