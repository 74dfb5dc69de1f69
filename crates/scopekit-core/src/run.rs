//! Run correlation identifiers.
//!
//! Every workflow invocation gets a fresh [`RunId`]. State events emitted on
//! behalf of a run carry it so that subscribers can drop stale updates from a
//! superseded run instead of relying on bus-level sequencing across runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_bus::{State, StateEvent};

/// Correlation identifier for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new unique run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Run({})", &self.0.to_string()[..8])
    }
}

/// Tracks the most recently started run and rejects events from older runs.
///
/// A run becomes "latest" when its start is observed, either through the
/// controller's `Starting` snapshot or through `AcquisitionStarted`. Events
/// that carry no run ID always pass.
///
/// ```rust,ignore
/// let mut filter = RunFilter::default();
/// ui_bus.subscribe(EventFilter::States, move |event| {
///     if let Event::State(state) = event {
///         if filter.accept(state) { render(state) }
///     }
/// });
/// ```
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    latest: Option<RunId>,
}

impl RunFilter {
    /// Create a filter with no run observed yet
    pub fn new() -> Self {
        Self::default()
    }

    /// The run currently considered active
    pub fn latest(&self) -> Option<RunId> {
        self.latest
    }

    /// Observe an event and decide whether it belongs to the latest run.
    pub fn accept(&mut self, event: &StateEvent) -> bool {
        if let Some(started) = Self::started_run(&event.state) {
            self.latest = Some(started);
            return true;
        }
        match event.run_id() {
            None => true,
            Some(run_id) => self.latest == Some(run_id),
        }
    }

    fn started_run(state: &State) -> Option<RunId> {
        match state {
            State::AcquisitionStarted { run_id, .. } => Some(*run_id),
            State::AcquisitionStateChanged(snapshot)
                if snapshot.phase == crate::data::AcquisitionPhase::Starting =>
            {
                snapshot.run_id
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AcquisitionConfig, ScanIndices, ScanTotals};
    use crate::event_bus::AcquisitionProgress;

    fn progress(run_id: RunId, done: u64) -> StateEvent {
        StateEvent::new(State::AcquisitionProgress(AcquisitionProgress {
            run_id,
            indices: ScanIndices::default(),
            totals: ScanTotals::default(),
            units_done: done,
            units_total: 10,
            percent: done as f64 * 10.0,
            eta_s: None,
            channel: "BF".to_string(),
        }))
    }

    fn started(run_id: RunId) -> StateEvent {
        StateEvent::new(State::AcquisitionStarted {
            run_id,
            config: AcquisitionConfig::default(),
        })
    }

    #[test]
    fn test_run_id_display_is_short() {
        let id = RunId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("Run("));
        assert_eq!(shown.len(), "Run(".len() + 8 + 1);
    }

    #[test]
    fn test_filter_rejects_superseded_run() {
        let old = RunId::new();
        let new = RunId::new();
        let mut filter = RunFilter::new();

        assert!(filter.accept(&started(old)));
        assert!(filter.accept(&progress(old, 3)));
        assert!(filter.accept(&started(new)));
        assert!(!filter.accept(&progress(old, 9)));
        assert!(filter.accept(&progress(new, 1)));
        assert_eq!(filter.latest(), Some(new));
    }

    #[test]
    fn test_filter_passes_events_without_run() {
        let mut filter = RunFilter::new();
        let event = StateEvent::new(State::FilterPositionChanged { position: 2 });
        assert!(filter.accept(&event));
    }
}
