//! Event Bus implementation.
//!
//! Provides the queued [`EventBus`]: `publish` only enqueues, and a single
//! dispatch thread drains the queue in FIFO order and invokes subscribers.
//! Every control-plane handler therefore runs on one logical thread no
//! matter which thread published the event.

use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{Event, EventKind};
use crate::error::EventBusError;

/// Name of the thread that delivers events to subscribers
pub const DISPATCH_THREAD_NAME: &str = "event-bus-dispatch";

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new unique subscription ID
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event types
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events of any of these kinds.
    Kinds(Vec<EventKind>),
    /// Receive every command.
    Commands,
    /// Receive every state notification.
    States,
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&event.kind()),
            EventFilter::Commands => matches!(event, Event::Command(_)),
            EventFilter::States => matches!(event, Event::State(_)),
        }
    }
}

/// Type alias for event handler functions
pub(crate) type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the async broadcast fan-out.
    pub channel_capacity: usize,
    /// Whether to keep event history.
    pub enable_history: bool,
    /// Maximum number of events to retain in history.
    pub max_history_size: usize,
    /// How long to retain events in history.
    pub history_retention: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            enable_history: false,
            max_history_size: 1000,
            history_retention: Duration::from_secs(300),
        }
    }
}

/// Event with timestamp for history
#[derive(Debug, Clone)]
struct TimestampedEvent {
    event: Event,
    timestamp: Instant,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    /// An event has been popped and its handlers are still running
    dispatching: bool,
    /// The dispatch thread is inside its loop
    running: bool,
    stop_requested: bool,
}

impl QueueState {
    fn quiescent(&self) -> bool {
        self.events.is_empty() && !self.dispatching
    }
}

#[derive(Default)]
struct Lifecycle {
    handle: Option<JoinHandle<()>>,
    /// `stop()` was called and no `start()` followed yet
    stopped: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    /// Signalled when events arrive or a stop is requested
    available: Condvar,
    /// Signalled when the bus becomes quiescent
    idle: Condvar,
    handlers: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<TimestampedEvent>>,
    sender: broadcast::Sender<Event>,
    dispatch_thread: Mutex<Option<ThreadId>>,
    config: EventBusConfig,
}

impl Shared {
    fn run(&self) {
        *self.dispatch_thread.lock() = Some(thread::current().id());
        tracing::debug!("Event bus dispatch thread started");

        loop {
            let event = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.stop_requested {
                        queue.running = false;
                        queue.stop_requested = false;
                        *self.dispatch_thread.lock() = None;
                        self.idle.notify_all();
                        tracing::debug!(
                            pending = queue.events.len(),
                            "Event bus dispatch thread stopped"
                        );
                        return;
                    }
                    if let Some(event) = queue.events.pop_front() {
                        queue.dispatching = true;
                        break event;
                    }
                    self.idle.notify_all();
                    self.available.wait(&mut queue);
                }
            };

            self.dispatch(&event);

            let mut queue = self.queue.lock();
            queue.dispatching = false;
            if queue.events.is_empty() {
                self.idle.notify_all();
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        tracing::trace!(kind = %event.kind(), "Dispatching event");

        if self.config.enable_history {
            self.add_to_history(event);
        }

        // Copy the matching handlers so subscribe/unsubscribe from inside a
        // handler never contends with this dispatch.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|s| s.filter.matches(event))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::error!(
                    kind = %event.kind(),
                    "Event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }

        if self.sender.receiver_count() > 0 {
            // Lagging receivers are their own problem.
            let _ = self.sender.send(event.clone());
        }
    }

    /// Add an event to history, maintaining size and age limits
    fn add_to_history(&self, event: &Event) {
        let mut history = self.history.write();
        let now = Instant::now();

        history.push_back(TimestampedEvent {
            event: event.clone(),
            timestamp: now,
        });

        let retention = self.config.history_retention;
        while history
            .front()
            .is_some_and(|e| now.duration_since(e.timestamp) > retention)
        {
            history.pop_front();
        }

        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }
}

/// Extract a readable message from a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Queued publish/subscribe bus with a single dispatch thread
pub struct EventBus {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl EventBus {
    /// Create a new event bus with default configuration
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a new event bus with custom configuration
    ///
    /// The dispatch thread is not spawned until [`start`](Self::start) or the
    /// first [`publish`](Self::publish).
    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                available: Condvar::new(),
                idle: Condvar::new(),
                handlers: RwLock::new(Vec::new()),
                history: RwLock::new(VecDeque::new()),
                sender,
                dispatch_thread: Mutex::new(None),
                config,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Start the dispatch thread.
    ///
    /// Starting a running bus is a no-op. Events queued while the bus was
    /// stopped are delivered once the thread runs.
    pub fn start(&self) -> Result<(), EventBusError> {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.stopped = false;

        {
            let mut queue = self.shared.queue.lock();
            if queue.running {
                if lifecycle.handle.is_some() {
                    // A thread that was asked to stop but has not left its
                    // loop yet simply keeps going.
                    queue.stop_requested = false;
                    return Ok(());
                }
                // Another caller is joining the old thread.
                while queue.running {
                    self.shared.idle.wait(&mut queue);
                }
            }
        }

        if let Some(old) = lifecycle.handle.take() {
            if old.thread().id() != thread::current().id() && old.join().is_err() {
                tracing::warn!("Previous dispatch thread ended with a panic");
            }
        }

        self.shared.queue.lock().running = true;
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                lifecycle.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.queue.lock().running = false;
                tracing::error!("Failed to spawn event bus dispatch thread: {}", e);
                Err(EventBusError::SpawnFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the dispatch thread after the event currently being dispatched.
    ///
    /// Queued events are kept and delivered on the next `start()`. When
    /// called from a handler the thread is not joined; it exits as soon as
    /// the handler returns.
    pub fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.stopped = true;

            {
                let mut queue = self.shared.queue.lock();
                if !queue.running {
                    return;
                }
                queue.stop_requested = true;
                self.shared.available.notify_all();
            }

            if self.is_dispatch_thread() {
                return;
            }
            lifecycle.handle.take()
        };

        // Joined without the lifecycle lock so a handler calling stop() or
        // start() meanwhile cannot deadlock against us.
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Dispatch thread ended with a panic");
            }
        }
    }

    /// Whether the dispatch thread is running
    pub fn is_running(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.running && !queue.stop_requested
    }

    /// Whether the calling thread is the dispatch thread
    pub fn is_dispatch_thread(&self) -> bool {
        *self.shared.dispatch_thread.lock() == Some(thread::current().id())
    }

    /// Enqueue an event for delivery and return immediately.
    ///
    /// Starts the dispatch thread lazily unless the bus was explicitly
    /// stopped, in which case the event waits for the next `start()`.
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        tracing::trace!(kind = %event.kind(), "Enqueueing event");

        let needs_start = {
            let mut queue = self.shared.queue.lock();
            queue.events.push_back(event);
            self.shared.available.notify_one();
            !queue.running
        };

        if needs_start && !self.lifecycle.lock().stopped {
            if let Err(e) = self.start() {
                tracing::error!("Event left queued: {}", e);
            }
        }
    }

    /// Block until the queue is empty and no event is being dispatched.
    ///
    /// Returns false on timeout, or immediately when called from the
    /// dispatch thread (which would otherwise wait on itself). A stopped bus
    /// reports whether its queue is already empty.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_dispatch_thread() {
            tracing::warn!("flush() called from the dispatch thread");
            return false;
        }

        let needs_start = {
            let queue = self.shared.queue.lock();
            !queue.running && !queue.events.is_empty()
        };
        if needs_start {
            if self.lifecycle.lock().stopped {
                return false;
            }
            if self.start().is_err() {
                return false;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.quiescent() {
            if !queue.running {
                return queue.events.is_empty();
            }
            if self.shared.idle.wait_until(&mut queue, deadline).timed_out() {
                return queue.quiescent();
            }
        }
        true
    }

    /// Drop every queued event that has not been dispatched yet.
    ///
    /// The event being dispatched, if any, still completes. Returns the
    /// number of events dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let dropped = queue.events.len();
        queue.events.clear();
        if !queue.dispatching {
            self.shared.idle.notify_all();
        }
        drop(queue);
        if dropped > 0 {
            tracing::debug!("Dropped {} queued events", dropped);
        }
        dropped
    }

    /// Number of events waiting to be dispatched
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().events.len()
    }

    /// Subscribe a handler to events matching `filter`.
    ///
    /// Handlers run on the dispatch thread, in subscription order, and must
    /// return quickly. Subscribing from inside a handler takes effect from
    /// the next dispatched event.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.shared.handlers.write().push(Subscription {
            id,
            filter,
            handler: Arc::new(handler),
        });
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Subscribe a handler to a single event kind
    pub fn subscribe_kind<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Kinds(vec![kind]), handler)
    }

    /// Unsubscribe from events
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.shared.handlers.write();
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        let removed = handlers.len() != before;
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get the number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.shared.handlers.read().len()
    }

    /// Get a receiver for async observers
    ///
    /// Events are forwarded after the synchronous handlers have run.
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.shared.sender.subscribe()
    }

    /// Get recent event history (if enabled)
    ///
    /// Returns events since the given instant, or all history if None.
    pub fn history(&self, since: Option<Instant>) -> Vec<Event> {
        if !self.shared.config.enable_history {
            return Vec::new();
        }

        let history = self.shared.history.read();
        match since {
            Some(since) => history
                .iter()
                .filter(|e| e.timestamp >= since)
                .map(|e| e.event.clone())
                .collect(),
            None => history.iter().map(|e| e.event.clone()).collect(),
        }
    }

    /// Clear event history
    pub fn clear_history(&self) {
        self.shared.history.write().clear();
    }

    /// Get the current configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.shared.config
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .field("config", &self.shared.config)
            .finish()
    }
}
