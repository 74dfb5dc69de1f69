//! Thread-affinity guarantees of the bus and the UI facade, exercised
//! through the public API only.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use scopekit_core::event_bus::DISPATCH_THREAD_NAME;
use scopekit_core::{
    Command, Event, EventBus, EventFilter, EventKind, GlobalMode, GlobalModeGate, RunFilter,
    RunId, State, UiDispatcher, UiEventBus,
};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn handlers_never_run_on_publisher_threads() {
    let bus = Arc::new(EventBus::new());
    let observed = Arc::new(Mutex::new(Vec::new()));

    let sink = observed.clone();
    bus.subscribe(EventFilter::All, move |_| {
        assert_eq!(thread::current().name(), Some(DISPATCH_THREAD_NAME));
        sink.lock().push(thread::current().id());
    });

    let mut publisher_ids = vec![thread::current().id()];
    let mut handles = Vec::new();
    for _ in 0..8 {
        let bus = bus.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                bus.publish(Command::HomeFilterWheel);
            }
            thread::current().id()
        }));
    }
    for handle in handles {
        publisher_ids.push(handle.join().unwrap());
    }
    bus.publish(Command::StopLive);
    assert!(bus.flush(WAIT));

    let observed = observed.lock();
    assert_eq!(observed.len(), 8 * 25 + 1);
    let dispatch = observed[0];
    assert!(observed.iter().all(|id| *id == dispatch));
    assert!(!publisher_ids.contains(&dispatch));
}

#[test]
fn per_publisher_order_is_preserved() {
    let bus = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    bus.subscribe_kind(EventKind::FilterPositionChanged, move |event| {
        if let Some(state) = event.as_state() {
            if let State::FilterPositionChanged { position } = state.state {
                sink.lock().push(position);
            }
        }
    });

    let worker_bus = bus.clone();
    thread::spawn(move || {
        for position in 0..500 {
            worker_bus.publish(State::FilterPositionChanged { position });
        }
    })
    .join()
    .unwrap();

    assert!(bus.flush(WAIT));
    assert_eq!(*seen.lock(), (0..500).collect::<Vec<_>>());
}

#[test]
fn ui_handlers_stay_on_ui_thread_and_drop_stale_runs() {
    let bus = Arc::new(EventBus::new());
    let dispatcher = Arc::new(UiDispatcher::new());
    let ui = UiEventBus::new(bus.clone(), dispatcher.clone());
    let gate = GlobalModeGate::new(bus.clone());

    let accepted = Arc::new(Mutex::new(Vec::new()));
    let off_thread = Arc::new(Mutex::new(0usize));
    let filter = Arc::new(Mutex::new(RunFilter::new()));
    let ui_thread = thread::current().id();

    let sink = accepted.clone();
    let strays = off_thread.clone();
    ui.subscribe(EventFilter::States, move |event: &Event| {
        if thread::current().id() != ui_thread {
            *strays.lock() += 1;
        }
        if let Some(state) = event.as_state() {
            if filter.lock().accept(state) {
                sink.lock().push(state.state.kind());
            }
        }
    });

    let old_run = RunId::new();
    let new_run = RunId::new();
    let worker_bus = bus.clone();
    thread::spawn(move || {
        worker_bus.publish(State::AcquisitionWorkerReady { run_id: old_run });
        worker_bus.publish(State::AcquisitionStarted {
            run_id: new_run,
            config: Default::default(),
        });
        worker_bus.publish(State::AcquisitionPaused { run_id: old_run });
        worker_bus.publish(State::AcquisitionPaused { run_id: new_run });
    })
    .join()
    .unwrap();
    gate.set_mode(GlobalMode::Live, "live view").unwrap();

    assert!(dispatcher.run_until(WAIT, || accepted.lock().len() == 3));
    assert_eq!(*off_thread.lock(), 0);
    assert_eq!(
        *accepted.lock(),
        vec![
            EventKind::AcquisitionStarted,
            EventKind::AcquisitionPaused,
            EventKind::ModeChanged,
        ]
    );
}
