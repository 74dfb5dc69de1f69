//! Service contract shared by every hardware service and controller.

use parking_lot::Mutex;
use std::sync::Arc;

use scopekit_core::event_bus::{Command, Event, EventBus, EventFilter, EventKind, State};
use scopekit_core::{GlobalModeGate, HardwareAction, HardwareError, SubscriptionId};

/// Shared handles every service needs: the bus to publish on and the mode
/// gate to consult before touching hardware on behalf of a command.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    bus: Arc<EventBus>,
    gate: Arc<GlobalModeGate>,
}

impl ServiceContext {
    /// Bundle a bus and a gate
    pub fn new(bus: Arc<EventBus>, gate: Arc<GlobalModeGate>) -> Self {
        Self { bus, gate }
    }

    /// The event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The mode gate
    pub fn gate(&self) -> &Arc<GlobalModeGate> {
        &self.gate
    }

    /// Publish a state notification
    pub fn publish(&self, state: State) {
        self.bus.publish(state);
    }

    /// Decide whether `command` may perform `action` in the current mode.
    ///
    /// A refusal is logged and published as `CommandRejected`; the caller
    /// must then leave the hardware alone.
    pub fn admit(&self, service: &str, command: &Command, action: HardwareAction) -> bool {
        if self.gate.permits(action) {
            return true;
        }
        let reason = format!("{} is not allowed in {} mode", action, self.gate.get_mode());
        self.reject(service, command.kind(), reason);
        false
    }

    /// Refuse a command without touching hardware
    pub fn reject(&self, service: &str, command: EventKind, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(service, command = %command, "Command rejected: {}", reason);
        self.publish(State::CommandRejected { command, reason });
    }

    /// Log a device fault hit on a command path and surface it on the bus
    pub fn report_fault(&self, service: &str, error: &HardwareError) {
        tracing::error!(service, "Hardware fault: {}", error);
        self.publish(State::ServiceFault {
            service: service.to_string(),
            error: error.to_string(),
        });
    }

    /// Surface a failed command: refused input becomes `CommandRejected`,
    /// anything the device raised becomes `ServiceFault`
    pub fn report_command_error(&self, service: &str, command: &Command, error: &HardwareError) {
        if error.is_invalid_input() {
            self.reject(service, command.kind(), error.to_string());
        } else {
            self.report_fault(service, error);
        }
    }
}

/// A command handler bound to the bus by a [`ServiceRegistry`]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs and fault reports
    fn name(&self) -> &'static str;

    /// Command kinds this service handles
    fn command_kinds(&self) -> &'static [EventKind];

    /// Handle one command. Runs on the dispatch thread.
    fn handle_command(&self, command: &Command);
}

/// Subscribes services to their commands and unsubscribes them on shutdown
#[derive(Debug)]
pub struct ServiceRegistry {
    bus: Arc<EventBus>,
    attached: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl ServiceRegistry {
    /// Create a registry attaching services to `bus`
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            attached: Mutex::new(Vec::new()),
        }
    }

    /// Route the service's command kinds to it.
    ///
    /// The bus only keeps a weak reference; the caller owns the service.
    pub fn attach<S: Service>(&self, service: &Arc<S>) -> SubscriptionId {
        let name = service.name();
        let weak = Arc::downgrade(service);
        let id = self.bus.subscribe(
            EventFilter::Kinds(service.command_kinds().to_vec()),
            move |event| {
                let Some(service) = weak.upgrade() else {
                    return;
                };
                if let Event::Command(command) = event {
                    service.handle_command(command);
                }
            },
        );
        tracing::debug!("Attached service {} as {}", name, id);
        self.attached.lock().push((name, id));
        id
    }

    /// Names of the attached services, in attach order
    pub fn services(&self) -> Vec<&'static str> {
        self.attached.lock().iter().map(|(name, _)| *name).collect()
    }

    /// Unsubscribe every attached service
    pub fn shutdown(&self) {
        let attached = std::mem::take(&mut *self.attached.lock());
        for (name, id) in attached {
            self.bus.unsubscribe(id);
            tracing::debug!("Detached service {}", name);
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopekit_core::GlobalMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        handled: AtomicUsize,
    }

    impl Service for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn command_kinds(&self) -> &'static [EventKind] {
            &[EventKind::HomeStage]
        }

        fn handle_command(&self, _command: &Command) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_registry_routes_and_detaches() {
        let bus = Arc::new(EventBus::new());
        let registry = ServiceRegistry::new(bus.clone());
        let service = Arc::new(Counting {
            handled: AtomicUsize::new(0),
        });

        registry.attach(&service);
        assert_eq!(registry.services(), vec!["counting"]);

        bus.publish(Command::HomeStage);
        bus.publish(Command::HomeFilterWheel);
        assert!(bus.flush(Duration::from_secs(5)));
        assert_eq!(service.handled.load(Ordering::SeqCst), 1);

        registry.shutdown();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Command::HomeStage);
        assert!(bus.flush(Duration::from_secs(5)));
        assert_eq!(service.handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_admit_rejects_while_acquiring() {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let ctx = ServiceContext::new(bus.clone(), gate.clone());
        let rejected = Arc::new(Mutex::new(Vec::new()));

        let sink = rejected.clone();
        bus.subscribe_kind(EventKind::CommandRejected, move |event| {
            if let Some(s) = event.as_state() {
                if let State::CommandRejected { command, .. } = &s.state {
                    sink.lock().push(*command);
                }
            }
        });

        assert!(ctx.admit("stage", &Command::HomeStage, HardwareAction::StageMotion));
        gate.set_mode(GlobalMode::Acquiring, "test").unwrap();
        assert!(!ctx.admit("stage", &Command::HomeStage, HardwareAction::StageMotion));

        assert!(bus.flush(Duration::from_secs(5)));
        assert_eq!(*rejected.lock(), vec![EventKind::HomeStage]);
    }

    #[test]
    fn test_command_errors_split_into_rejections_and_faults() {
        let bus = Arc::new(EventBus::new());
        let gate = Arc::new(GlobalModeGate::new(bus.clone()));
        let ctx = ServiceContext::new(bus.clone(), gate);
        let kinds = Arc::new(Mutex::new(Vec::new()));

        let sink = kinds.clone();
        bus.subscribe(
            EventFilter::Kinds(vec![EventKind::CommandRejected, EventKind::ServiceFault]),
            move |event| sink.lock().push(event.kind()),
        );

        let command = Command::SetExposureTime {
            exposure_ms: f64::NAN,
        };
        ctx.report_command_error(
            "camera",
            &command,
            &HardwareError::invalid_input("camera", "not finite"),
        );
        ctx.report_command_error("camera", &command, &HardwareError::fault("camera", "usb"));

        assert!(bus.flush(Duration::from_secs(5)));
        assert_eq!(
            *kinds.lock(),
            vec![EventKind::CommandRejected, EventKind::ServiceFault]
        );
    }
}
