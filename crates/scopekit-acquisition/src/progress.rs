//! Progress throttling and ETA estimation

use std::time::{Duration, Instant};

use scopekit_core::data::{ScanIndices, ScanTotals};
use scopekit_core::{AcquisitionProgress, RunId};

/// Counts completed units and decides when a progress report is due.
///
/// Reports are rate limited to one per `interval`; the final unit always
/// produces exactly one 100% report.
#[derive(Debug)]
pub struct ProgressTracker {
    run_id: RunId,
    totals: ScanTotals,
    started: Instant,
    interval: Duration,
    last_publish: Option<Instant>,
    done: u64,
    finished_reported: bool,
}

impl ProgressTracker {
    /// Start tracking a run
    pub fn new(run_id: RunId, totals: ScanTotals, interval: Duration) -> Self {
        Self {
            run_id,
            totals,
            started: Instant::now(),
            interval,
            last_publish: None,
            done: 0,
            finished_reported: false,
        }
    }

    /// Units completed so far
    pub fn units_done(&self) -> u64 {
        self.done
    }

    /// Record a completed unit and return a report when one is due
    pub fn record(&mut self, indices: ScanIndices, label: &str) -> Option<AcquisitionProgress> {
        self.done = (self.done + 1).min(self.totals.units);
        let now = Instant::now();

        let last = self.done == self.totals.units;
        if last {
            if self.finished_reported {
                return None;
            }
            self.finished_reported = true;
        } else if let Some(previous) = self.last_publish {
            if now.duration_since(previous) < self.interval {
                return None;
            }
        }

        self.last_publish = Some(now);
        let percent = self.percent();
        Some(AcquisitionProgress {
            run_id: self.run_id,
            indices,
            totals: self.totals,
            units_done: self.done,
            units_total: self.totals.units,
            percent,
            eta_s: self.eta(now, percent),
            channel: label.to_string(),
        })
    }

    fn percent(&self) -> f64 {
        if self.totals.units == 0 {
            return 100.0;
        }
        self.done as f64 * 100.0 / self.totals.units as f64
    }

    fn eta(&self, now: Instant, percent: f64) -> Option<f64> {
        if percent <= 0.0 {
            return None;
        }
        if self.done >= self.totals.units {
            return Some(0.0);
        }
        let elapsed = now.duration_since(self.started).as_secs_f64();
        Some((elapsed * 100.0 / percent - elapsed).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(units: u64) -> ScanTotals {
        ScanTotals {
            regions: 1,
            time_points: 1,
            z_planes: 1,
            channel_groups: 1,
            units,
        }
    }

    #[test]
    fn test_final_report_is_exactly_once() {
        let mut tracker = ProgressTracker::new(RunId::new(), totals(4), Duration::from_secs(3600));
        let reports: Vec<_> = (0..4)
            .filter_map(|_| tracker.record(ScanIndices::default(), "GFP"))
            .collect();

        // The first unit reports immediately, the rest are throttled except the last.
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].percent, 100.0);
        assert_eq!(reports[1].units_done, 4);
        assert_eq!(reports[1].eta_s, Some(0.0));
        assert!(tracker.record(ScanIndices::default(), "GFP").is_none());
        assert_eq!(tracker.units_done(), 4);
    }

    #[test]
    fn test_zero_interval_reports_every_unit() {
        let mut tracker = ProgressTracker::new(RunId::new(), totals(3), Duration::ZERO);
        let percents: Vec<f64> = (0..3)
            .filter_map(|_| tracker.record(ScanIndices::default(), "BF"))
            .map(|p| p.percent)
            .collect();
        assert_eq!(percents.len(), 3);
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents[2], 100.0);
    }
}
