//! Filter wheel service

use parking_lot::Mutex;

use scopekit_core::event_bus::{Command, EventKind, State};
use scopekit_core::HardwareAction;

use crate::hardware::{DeviceResult, FilterWheel};
use crate::service::{Service, ServiceContext};

const NAME: &str = "filter wheel";

/// Thread-safe wrapper around a filter wheel.
///
/// Requested slots are clamped to `1..=slots`.
pub struct FilterWheelService {
    ctx: ServiceContext,
    wheel: Mutex<Box<dyn FilterWheel>>,
}

impl FilterWheelService {
    /// Wrap a filter wheel driver
    pub fn new(wheel: impl FilterWheel + 'static, ctx: ServiceContext) -> Self {
        Self {
            ctx,
            wheel: Mutex::new(Box::new(wheel)),
        }
    }

    /// Rotate to a slot, returning the slot reached
    pub fn set_position(&self, position: u32) -> DeviceResult<u32> {
        let reached = {
            let mut wheel = self.wheel.lock();
            let target = position.clamp(1, wheel.slots().max(1));
            if target != position {
                tracing::debug!("Filter slot {} clamped to {}", position, target);
            }
            if wheel.position()? != target {
                wheel.set_position(target)?;
            }
            wheel.position()?
        };
        self.ctx.publish(State::FilterPositionChanged { position: reached });
        Ok(reached)
    }

    /// Home the wheel
    pub fn home(&self) -> DeviceResult<u32> {
        let reached = {
            let mut wheel = self.wheel.lock();
            wheel.home()?;
            wheel.position()?
        };
        self.ctx.publish(State::FilterPositionChanged { position: reached });
        Ok(reached)
    }

    /// Current slot
    pub fn position(&self) -> DeviceResult<u32> {
        self.wheel.lock().position()
    }

    /// Number of slots
    pub fn slots(&self) -> u32 {
        self.wheel.lock().slots()
    }
}

impl Service for FilterWheelService {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[EventKind::SetFilterPosition, EventKind::HomeFilterWheel]
    }

    fn handle_command(&self, command: &Command) {
        if !self.ctx.admit(NAME, command, HardwareAction::FilterWheel) {
            return;
        }
        let result = match command {
            Command::SetFilterPosition { position } => self.set_position(*position),
            Command::HomeFilterWheel => self.home(),
            _ => return,
        };
        if let Err(e) = result {
            self.ctx.report_command_error(NAME, command, &e);
        }
    }
}
