//! Stage service

use parking_lot::Mutex;

use scopekit_core::data::{Axis, StagePosition};
use scopekit_core::event_bus::{Command, EventKind, State};
use scopekit_core::{HardwareAction, HardwareError};

use crate::hardware::{DeviceResult, Stage, StageLimits};
use crate::service::{Service, ServiceContext};

const NAME: &str = "stage";

/// Thread-safe wrapper around one XYZ stage.
///
/// Targets outside the travel range are clamped, not refused. Non-finite
/// coordinates are refused before the stage moves.
pub struct StageService {
    ctx: ServiceContext,
    stage: Mutex<Box<dyn Stage>>,
}

impl StageService {
    /// Wrap a stage driver
    pub fn new(stage: impl Stage + 'static, ctx: ServiceContext) -> Self {
        Self {
            ctx,
            stage: Mutex::new(Box::new(stage)),
        }
    }

    /// Current position
    pub fn position(&self) -> DeviceResult<StagePosition> {
        self.stage.lock().position()
    }

    /// Travel range
    pub fn limits(&self) -> StageLimits {
        self.stage.lock().limits()
    }

    /// Move one axis by a relative distance
    pub fn move_relative(&self, axis: Axis, distance_mm: f64) -> DeviceResult<StagePosition> {
        require_finite(axis, distance_mm)?;
        let reached = {
            let mut stage = self.stage.lock();
            let current = stage.position()?;
            let target = current.with_axis(axis, current.axis(axis) + distance_mm);
            Self::move_clamped(stage.as_mut(), target)?
        };
        self.publish_position(reached);
        Ok(reached)
    }

    /// Move to an absolute position; `None` axes stay where they are
    pub fn move_to(
        &self,
        x_mm: Option<f64>,
        y_mm: Option<f64>,
        z_mm: Option<f64>,
    ) -> DeviceResult<StagePosition> {
        for (axis, value) in [(Axis::X, x_mm), (Axis::Y, y_mm), (Axis::Z, z_mm)] {
            if let Some(value) = value {
                require_finite(axis, value)?;
            }
        }
        let reached = {
            let mut stage = self.stage.lock();
            let current = stage.position()?;
            let target = StagePosition::new(
                x_mm.unwrap_or(current.x_mm),
                y_mm.unwrap_or(current.y_mm),
                z_mm.unwrap_or(current.z_mm),
            );
            Self::move_clamped(stage.as_mut(), target)?
        };
        self.publish_position(reached);
        Ok(reached)
    }

    /// Move only the focus axis
    pub fn move_z_to(&self, z_mm: f64) -> DeviceResult<StagePosition> {
        self.move_to(None, None, Some(z_mm))
    }

    /// Home all axes
    pub fn home(&self) -> DeviceResult<StagePosition> {
        let reached = {
            let mut stage = self.stage.lock();
            stage.home()?;
            stage.position()?
        };
        self.publish_position(reached);
        Ok(reached)
    }

    fn move_clamped(stage: &mut dyn Stage, target: StagePosition) -> DeviceResult<StagePosition> {
        let clamped = stage.limits().clamp(target);
        if clamped != target {
            tracing::debug!("Stage target {} clamped to {}", target, clamped);
        }
        stage.move_to(clamped)?;
        stage.position()
    }

    fn publish_position(&self, position: StagePosition) {
        self.ctx.publish(State::StagePositionChanged {
            x_mm: position.x_mm,
            y_mm: position.y_mm,
            z_mm: position.z_mm,
        });
    }
}

fn require_finite(axis: Axis, value_mm: f64) -> DeviceResult<()> {
    if value_mm.is_finite() {
        Ok(())
    } else {
        Err(HardwareError::invalid_input(
            NAME,
            format!("{} coordinate {} mm is not finite", axis, value_mm),
        ))
    }
}

impl Service for StageService {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[EventKind::MoveStage, EventKind::MoveStageTo, EventKind::HomeStage]
    }

    fn handle_command(&self, command: &Command) {
        if !self.ctx.admit(NAME, command, HardwareAction::StageMotion) {
            return;
        }
        let result = match command {
            Command::MoveStage { axis, distance_mm } => self.move_relative(*axis, *distance_mm),
            Command::MoveStageTo { x_mm, y_mm, z_mm } => self.move_to(*x_mm, *y_mm, *z_mm),
            Command::HomeStage => self.home(),
            _ => return,
        };
        if let Err(e) = result {
            self.ctx.report_command_error(NAME, command, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedStage;
    use scopekit_core::{EventBus, GlobalModeGate};
    use std::sync::Arc;

    fn service() -> (SimulatedStage, StageService) {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let stage = SimulatedStage::new();
        let service = StageService::new(stage.clone(), ServiceContext::new(bus, gate));
        (stage, service)
    }

    #[test]
    fn test_relative_move() {
        let (stage, service) = service();
        service.move_relative(Axis::X, 2.5).unwrap();
        service.move_relative(Axis::X, 1.0).unwrap();
        assert_eq!(stage.current().x_mm, 3.5);
    }

    #[test]
    fn test_targets_are_clamped() {
        let (stage, service) = service();
        let reached = service.move_to(Some(500.0), None, Some(-1.0)).unwrap();
        assert_eq!(reached.x_mm, StageLimits::default().max.x_mm);
        assert_eq!(reached.z_mm, 0.0);
        assert_eq!(stage.current(), reached);
    }

    #[test]
    fn test_non_finite_targets_are_refused() {
        let (stage, service) = service();
        service.move_to(Some(10.0), Some(20.0), Some(1.0)).unwrap();
        let before = stage.moves().len();

        assert!(service
            .move_relative(Axis::Y, f64::NAN)
            .unwrap_err()
            .is_invalid_input());
        assert!(service
            .move_to(Some(f64::INFINITY), None, None)
            .unwrap_err()
            .is_invalid_input());
        assert!(service.move_z_to(f64::NAN).unwrap_err().is_invalid_input());

        assert_eq!(stage.moves().len(), before);
        assert_eq!(stage.current(), StagePosition::new(10.0, 20.0, 1.0));
    }

    #[test]
    fn test_fault_propagates_to_direct_callers() {
        let (stage, service) = service();
        stage.faults().fail_after(0, "encoder lost");
        assert!(service.move_z_to(1.0).is_err());
        assert_eq!(stage.current().z_mm, 0.0);
    }
}
