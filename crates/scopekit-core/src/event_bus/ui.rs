//! UI-thread marshaling on top of the core bus.
//!
//! The frontend owns a [`UiDispatcher`] (its own task queue, pumped by its
//! main loop). [`UiEventBus`] registers wrappers on the core [`EventBus`]
//! that hop each delivery over to that queue, so UI handlers only ever run
//! on the UI thread.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::bus::{panic_message, EventBus, EventFilter, SubscriptionId};
use super::events::Event;

type Task = Box<dyn FnOnce() + Send>;

/// Task queue bound to the thread that created it
pub struct UiDispatcher {
    thread: ThreadId,
    tasks: Mutex<VecDeque<Task>>,
    posted: Condvar,
}

impl UiDispatcher {
    /// Create a dispatcher owned by the calling thread
    pub fn new() -> Self {
        Self {
            thread: thread::current().id(),
            tasks: Mutex::new(VecDeque::new()),
            posted: Condvar::new(),
        }
    }

    /// Whether the caller is the UI thread
    pub fn is_ui_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue a task for the UI thread. Callable from any thread.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().push_back(Box::new(task));
        self.posted.notify_all();
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run every task queued so far. Returns how many ran.
    ///
    /// Must be called on the UI thread; anywhere else nothing runs.
    pub fn run_pending(&self) -> usize {
        if !self.is_ui_thread() {
            tracing::warn!("UiDispatcher::run_pending called off the UI thread");
            return 0;
        }

        let tasks: Vec<Task> = self.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!("UI task panicked: {}", panic_message(panic.as_ref()));
            }
        }
        count
    }

    /// Pump the queue for `duration`. Returns how many tasks ran.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            ran += self.run_pending();
            if Instant::now() >= deadline || !self.is_ui_thread() {
                return ran;
            }
            self.wait_for_tasks(deadline);
        }
    }

    /// Pump the queue until `predicate` holds or `timeout` elapses.
    ///
    /// Returns the final value of `predicate`.
    pub fn run_until<P>(&self, timeout: Duration, mut predicate: P) -> bool
    where
        P: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if predicate() {
                return true;
            }
            if Instant::now() >= deadline || !self.is_ui_thread() {
                return false;
            }
            // Short slices so predicates over non-UI state are re-checked.
            self.wait_for_tasks(deadline.min(Instant::now() + Duration::from_millis(10)));
        }
    }

    fn wait_for_tasks(&self, deadline: Instant) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            let _ = self.posted.wait_until(&mut tasks, deadline);
        }
    }
}

impl Default for UiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UiDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiDispatcher")
            .field("thread", &self.thread)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Event bus facade whose handlers run on the UI thread
pub struct UiEventBus {
    bus: Arc<EventBus>,
    dispatcher: Arc<UiDispatcher>,
    wrappers: Mutex<HashMap<SubscriptionId, Arc<AtomicBool>>>,
}

impl UiEventBus {
    /// Wrap `bus`, marshaling handlers onto `dispatcher`'s thread
    pub fn new(bus: Arc<EventBus>, dispatcher: Arc<UiDispatcher>) -> Self {
        Self {
            bus,
            dispatcher,
            wrappers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe a handler that always executes on the UI thread.
    ///
    /// Delivered on the spot when the bus already dispatches on the UI
    /// thread, otherwise posted to the dispatcher.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let handler = Arc::new(handler);
        let dispatcher = self.dispatcher.clone();
        let flag = active.clone();

        let id = self.bus.subscribe(filter, move |event| {
            if !flag.load(Ordering::Acquire) {
                return;
            }
            if dispatcher.is_ui_thread() {
                handler(event);
                return;
            }
            let handler = handler.clone();
            let flag = flag.clone();
            let event = event.clone();
            dispatcher.post(move || {
                if flag.load(Ordering::Acquire) {
                    handler(&event);
                }
            });
        });

        self.wrappers.lock().insert(id, active);
        id
    }

    /// Remove a UI subscription.
    ///
    /// Deliveries already posted but not yet run are skipped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(active) = self.wrappers.lock().remove(&id) else {
            tracing::warn!("Unknown UI subscription {}", id);
            return false;
        };
        active.store(false, Ordering::Release);
        self.bus.unsubscribe(id)
    }

    /// Forward an event (normally a command) to the core bus
    pub fn publish(&self, event: impl Into<Event>) {
        self.bus.publish(event);
    }

    /// Number of live UI subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.wrappers.lock().len()
    }

    /// The UI dispatcher
    pub fn dispatcher(&self) -> &Arc<UiDispatcher> {
        &self.dispatcher
    }

    /// The wrapped core bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl Drop for UiEventBus {
    fn drop(&mut self) {
        for (id, active) in self.wrappers.lock().drain() {
            active.store(false, Ordering::Release);
            self.bus.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{Command, EventKind, State};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_handlers_run_on_ui_thread() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(UiDispatcher::new());
        let ui = UiEventBus::new(bus.clone(), dispatcher.clone());
        let ui_thread = thread::current().id();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ui.subscribe(EventFilter::States, move |_| {
            sink.lock().push(thread::current().id());
        });

        let worker_bus = bus.clone();
        let worker = thread::spawn(move || {
            for position in 1..=3 {
                worker_bus.publish(State::FilterPositionChanged { position });
            }
        });
        worker.join().unwrap();

        assert!(dispatcher.run_until(WAIT, || seen.lock().len() == 3));
        assert!(seen.lock().iter().all(|id| *id == ui_thread));
    }

    #[test]
    fn test_unsubscribe_skips_posted_tasks() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(UiDispatcher::new());
        let ui = UiEventBus::new(bus.clone(), dispatcher.clone());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = ui.subscribe(EventFilter::Kinds(vec![EventKind::HomeStage]), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ui.publish(Command::HomeStage);
        assert!(bus.flush(WAIT));
        assert_eq!(dispatcher.pending(), 1);

        assert!(ui.unsubscribe(id));
        assert!(!ui.unsubscribe(id));
        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(ui.subscriber_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_run_pending_off_thread_runs_nothing() {
        let dispatcher = Arc::new(UiDispatcher::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let d = dispatcher.clone();
        let ran = thread::spawn(move || d.run_pending()).join().unwrap();
        assert_eq!(ran, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let dispatcher = UiDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.post(|| panic!("bad task"));
        let c = count.clone();
        dispatcher.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.run_pending(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
