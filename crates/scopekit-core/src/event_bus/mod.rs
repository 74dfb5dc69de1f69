//! # Event Bus Module
//!
//! Queued publish/subscribe between the UI, controllers, services and
//! workers.
//!
//! ## Overview
//!
//! - Publishers enqueue typed events and return immediately
//! - One dispatch thread drains the queue in FIFO order and runs handlers
//! - UI code subscribes through [`UiEventBus`] so its handlers run on the UI
//!   thread instead of the dispatch thread
//! - Async observers can take a broadcast [`EventBus::receiver`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scopekit_core::event_bus::{Command, EventBus, EventFilter, EventKind};
//!
//! let bus = Arc::new(EventBus::new());
//! let id = bus.subscribe(EventFilter::Kinds(vec![EventKind::ModeChanged]), |event| {
//!     tracing::info!("{}", event.description());
//! });
//!
//! bus.publish(Command::HomeStage);
//! bus.flush(Duration::from_secs(1));
//! bus.unsubscribe(id);
//! ```

mod bus;
mod events;
mod ui;

pub use bus::*;
pub use events::*;
pub use ui::{UiDispatcher, UiEventBus};
