//! Illumination service

use parking_lot::Mutex;

use scopekit_core::event_bus::{Command, EventKind, State};
use scopekit_core::{HardwareAction, HardwareError};

use crate::hardware::{DeviceResult, Illumination};
use crate::service::{Service, ServiceContext};

const NAME: &str = "illumination";

/// Thread-safe wrapper around a light engine
pub struct IlluminationService {
    ctx: ServiceContext,
    light: Mutex<Box<dyn Illumination>>,
}

impl IlluminationService {
    /// Wrap a light engine driver
    pub fn new(light: impl Illumination + 'static, ctx: ServiceContext) -> Self {
        Self {
            ctx,
            light: Mutex::new(Box::new(light)),
        }
    }

    /// Available sources
    pub fn sources(&self) -> Vec<u32> {
        self.light.lock().sources()
    }

    /// Whether a source is on
    pub fn is_on(&self, source: u32) -> bool {
        self.light.lock().is_enabled(source)
    }

    /// Set a source's intensity (clamped to 0-100) and shutter state
    pub fn set_source(&self, source: u32, intensity_percent: f64, on: bool) -> DeviceResult<()> {
        if !intensity_percent.is_finite() {
            return Err(HardwareError::invalid_input(
                NAME,
                format!("intensity {}% for source {} is not finite", intensity_percent, source),
            ));
        }
        let intensity = intensity_percent.clamp(0.0, 100.0);
        {
            let mut light = self.light.lock();
            light.set_intensity(source, intensity)?;
            light.set_enabled(source, on)?;
        }
        self.ctx.publish(State::IlluminationChanged {
            source,
            intensity_percent: intensity,
            on,
        });
        Ok(())
    }

    /// Turn a source on at the given intensity
    pub fn turn_on(&self, source: u32, intensity_percent: f64) -> DeviceResult<()> {
        self.set_source(source, intensity_percent, true)
    }

    /// Turn a source off
    pub fn turn_off(&self, source: u32) -> DeviceResult<()> {
        {
            let mut light = self.light.lock();
            light.set_enabled(source, false)?;
        }
        self.ctx.publish(State::IlluminationChanged {
            source,
            intensity_percent: 0.0,
            on: false,
        });
        Ok(())
    }

    /// Turn every source off.
    ///
    /// Keeps going after a failing source so as many as possible end up
    /// dark; the first error is returned.
    pub fn all_off(&self) -> DeviceResult<()> {
        let mut first_error: Option<HardwareError> = None;
        let mut switched = Vec::new();
        {
            let mut light = self.light.lock();
            for source in light.sources() {
                if !light.is_enabled(source) {
                    continue;
                }
                match light.set_enabled(source, false) {
                    Ok(()) => switched.push(source),
                    Err(e) => {
                        tracing::error!("Failed to switch off source {}: {}", source, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        for source in switched {
            self.ctx.publish(State::IlluminationChanged {
                source,
                intensity_percent: 0.0,
                on: false,
            });
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Service for IlluminationService {
    fn name(&self) -> &'static str {
        NAME
    }

    fn command_kinds(&self) -> &'static [EventKind] {
        &[EventKind::SetIllumination]
    }

    fn handle_command(&self, command: &Command) {
        let Command::SetIllumination {
            source,
            intensity_percent,
            on,
        } = command
        else {
            return;
        };
        if !self.ctx.admit(NAME, command, HardwareAction::Illumination) {
            return;
        }
        if let Err(e) = self.set_source(*source, *intensity_percent, *on) {
            self.ctx.report_command_error(NAME, command, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedIllumination;
    use scopekit_core::{EventBus, GlobalModeGate};
    use std::sync::Arc;

    fn service() -> (SimulatedIllumination, IlluminationService) {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let light = SimulatedIllumination::default();
        let service = IlluminationService::new(light.clone(), ServiceContext::new(bus, gate));
        (light, service)
    }

    #[test]
    fn test_on_off() {
        let (light, service) = service();
        service.turn_on(488, 150.0).unwrap();
        assert!(service.is_on(488));
        service.turn_on(561, 20.0).unwrap();
        service.all_off().unwrap();
        assert!(!light.any_on());
        assert_eq!(
            light.switches(),
            vec![(488, true), (561, true), (488, false), (561, false)]
        );
    }

    #[test]
    fn test_non_finite_intensity_leaves_source_alone() {
        let (light, service) = service();
        let err = service.turn_on(488, f64::NAN).unwrap_err();
        assert!(err.is_invalid_input());
        assert!(service.set_source(561, f64::INFINITY, true).is_err());
        assert!(!light.any_on());
        assert!(light.switches().is_empty());
    }

    #[test]
    fn test_unknown_source_is_a_fault() {
        let (_light, service) = service();
        assert!(service.turn_on(999, 10.0).is_err());
    }
}
