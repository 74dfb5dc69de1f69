//! Acquisition configuration and state snapshots.
//!
//! [`AcquisitionConfig`] is created by configuration input and is immutable
//! once a run starts. [`AcquisitionState`] is owned by the acquisition
//! controller and published as a copy whenever it changes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::ConfigError;
use crate::run::RunId;

/// Upper bound on capture units in a single run
pub const MAX_CAPTURE_UNITS: u64 = 10_000_000;

/// One scan region, visited in configured order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Unique region name (e.g. well ID)
    pub name: String,
    /// Stage X coordinate in mm
    pub x_mm: f64,
    /// Stage Y coordinate in mm
    pub y_mm: f64,
    /// Reference focus Z coordinate in mm
    pub z_mm: f64,
}

impl Region {
    /// Create a region at the given stage coordinates
    pub fn new(name: impl Into<String>, x_mm: f64, y_mm: f64, z_mm: f64) -> Self {
        Self {
            name: name.into(),
            x_mm,
            y_mm,
            z_mm,
        }
    }
}

/// Where the z-stack starts relative to the region's focus plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZAnchor {
    /// The focus plane is the bottom of the stack.
    #[default]
    FromBottom,
    /// The focus plane is the middle of the stack.
    FromCenter,
}

/// Z-stack parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZStack {
    /// Number of planes (at least 1)
    pub planes: u32,
    /// Distance between planes in micrometers
    pub step_um: f64,
    /// Stack anchoring
    #[serde(default)]
    pub anchor: ZAnchor,
}

impl ZStack {
    /// Single focal plane
    pub fn single() -> Self {
        Self {
            planes: 1,
            step_um: 0.0,
            anchor: ZAnchor::FromBottom,
        }
    }

    /// Offset of a plane from the region's focus plane, in micrometers
    pub fn offset_um(&self, plane: u32) -> f64 {
        let base = match self.anchor {
            ZAnchor::FromBottom => 0.0,
            ZAnchor::FromCenter => -self.step_um * ((self.planes.saturating_sub(1)) / 2) as f64,
        };
        base + self.step_um * plane as f64
    }
}

impl Default for ZStack {
    fn default() -> Self {
        Self::single()
    }
}

/// How the channels of a group are captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupMode {
    /// One capture per channel, in listed order.
    #[default]
    Sequential,
    /// All channels in one synchronized capture, ordered by trigger offset.
    Simultaneous,
}

/// Per-channel acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel display name
    pub name: String,
    /// Camera exposure in milliseconds
    pub exposure_ms: f64,
    /// Camera analog gain
    #[serde(default)]
    pub analog_gain: f64,
    /// Illumination source identifier (wavelength or port)
    pub illumination_source: u32,
    /// Illumination intensity, 0-100
    pub intensity_percent: f64,
    /// Emission filter wheel position, if the channel needs one
    #[serde(default)]
    pub filter_position: Option<u32>,
    /// Focus offset applied while capturing this channel, micrometers
    #[serde(default)]
    pub z_offset_um: f64,
    /// Trigger offset within a simultaneous group, milliseconds
    #[serde(default)]
    pub trigger_offset_ms: f64,
}

impl ChannelSpec {
    /// Create a channel with neutral gain, no filter and no offsets
    pub fn new(
        name: impl Into<String>,
        exposure_ms: f64,
        illumination_source: u32,
        intensity_percent: f64,
    ) -> Self {
        Self {
            name: name.into(),
            exposure_ms,
            analog_gain: 0.0,
            illumination_source,
            intensity_percent,
            filter_position: None,
            z_offset_um: 0.0,
            trigger_offset_ms: 0.0,
        }
    }

    /// Set the filter wheel position
    pub fn with_filter(mut self, position: u32) -> Self {
        self.filter_position = Some(position);
        self
    }

    /// Set the trigger offset used inside simultaneous groups
    pub fn with_trigger_offset(mut self, offset_ms: f64) -> Self {
        self.trigger_offset_ms = offset_ms;
        self
    }

    /// Set the per-channel focus offset
    pub fn with_z_offset(mut self, offset_um: f64) -> Self {
        self.z_offset_um = offset_um;
        self
    }
}

/// A set of channels captured together or one after another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    /// Group display name
    pub name: String,
    /// Capture mode
    #[serde(default)]
    pub mode: GroupMode,
    /// Channels in configured order
    pub channels: Vec<ChannelSpec>,
}

impl ChannelGroup {
    /// Group whose channels are captured one at a time
    pub fn sequential(name: impl Into<String>, channels: Vec<ChannelSpec>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::Sequential,
            channels,
        }
    }

    /// Group whose channels share one synchronized trigger
    pub fn simultaneous(name: impl Into<String>, channels: Vec<ChannelSpec>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::Simultaneous,
            channels,
        }
    }

    /// Number of capture units this group contributes per z-plane
    pub fn capture_units(&self) -> usize {
        match self.mode {
            GroupMode::Sequential => self.channels.len(),
            GroupMode::Simultaneous => usize::from(!self.channels.is_empty()),
        }
    }

    /// Channels in the order they must be dispatched.
    ///
    /// Simultaneous groups are sorted ascending by trigger offset; ties keep
    /// their configured order.
    pub fn dispatch_order(&self) -> Vec<&ChannelSpec> {
        let mut ordered: Vec<&ChannelSpec> = self.channels.iter().collect();
        if self.mode == GroupMode::Simultaneous {
            ordered.sort_by(|a, b| a.trigger_offset_ms.total_cmp(&b.trigger_offset_ms));
        }
        ordered
    }
}

/// Time-lapse parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Number of time points (at least 1)
    pub points: u32,
    /// Interval between time point starts, seconds (0 = back to back)
    pub interval_s: f64,
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self {
            points: 1,
            interval_s: 0.0,
        }
    }
}

/// Autofocus interleaving
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutofocusPlan {
    /// Run autofocus during the scan
    pub enabled: bool,
    /// Focus on every Nth region visit
    pub every_n_regions: u32,
}

impl Default for AutofocusPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            every_n_regions: 1,
        }
    }
}

/// Complete description of one multi-dimensional acquisition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Run identifier, stamped by the controller when the run starts
    #[serde(default)]
    pub run_id: Option<RunId>,
    /// Regions in visiting order
    pub regions: Vec<Region>,
    /// Z-stack parameters
    #[serde(default)]
    pub z_stack: ZStack,
    /// Channel groups in capture order
    pub channel_groups: Vec<ChannelGroup>,
    /// Time-lapse parameters
    #[serde(default)]
    pub time_series: TimeSeries,
    /// Autofocus interleaving
    #[serde(default)]
    pub autofocus: AutofocusPlan,
}

impl AcquisitionConfig {
    /// Create a config for the given regions and channel groups with a single
    /// plane, a single time point and autofocus disabled
    pub fn new(regions: Vec<Region>, channel_groups: Vec<ChannelGroup>) -> Self {
        Self {
            run_id: None,
            regions,
            z_stack: ZStack::default(),
            channel_groups,
            time_series: TimeSeries::default(),
            autofocus: AutofocusPlan::default(),
        }
    }

    /// Return a copy stamped with the given run ID
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }
        if self.channel_groups.is_empty() {
            return Err(ConfigError::NoChannelGroups);
        }

        let mut names = HashSet::new();
        for region in &self.regions {
            if !names.insert(region.name.as_str()) {
                return Err(ConfigError::DuplicateRegion {
                    name: region.name.clone(),
                });
            }
            for (field, value) in [
                ("x_mm", region.x_mm),
                ("y_mm", region.y_mm),
                ("z_mm", region.z_mm),
            ] {
                require_finite(&format!("regions[{}].{}", region.name, field), value)?;
            }
        }

        if self.z_stack.planes == 0 {
            return Err(ConfigError::invalid("z_stack.planes", "must be at least 1"));
        }
        require_non_negative("z_stack.step_um", self.z_stack.step_um)?;

        if self.time_series.points == 0 {
            return Err(ConfigError::invalid(
                "time_series.points",
                "must be at least 1",
            ));
        }
        require_non_negative("time_series.interval_s", self.time_series.interval_s)?;

        if self.autofocus.enabled && self.autofocus.every_n_regions == 0 {
            return Err(ConfigError::invalid(
                "autofocus.every_n_regions",
                "must be at least 1 when autofocus is enabled",
            ));
        }

        for group in &self.channel_groups {
            if group.channels.is_empty() {
                return Err(ConfigError::EmptyChannelGroup {
                    group: group.name.clone(),
                });
            }
            for channel in &group.channels {
                let prefix = format!("{}.{}", group.name, channel.name);
                require_finite(&format!("{}.exposure_ms", prefix), channel.exposure_ms)?;
                if channel.exposure_ms <= 0.0 {
                    return Err(ConfigError::invalid(
                        format!("{}.exposure_ms", prefix),
                        "must be positive",
                    ));
                }
                require_non_negative(&format!("{}.analog_gain", prefix), channel.analog_gain)?;
                require_finite(&format!("{}.intensity_percent", prefix), channel.intensity_percent)?;
                if !(0.0..=100.0).contains(&channel.intensity_percent) {
                    return Err(ConfigError::invalid(
                        format!("{}.intensity_percent", prefix),
                        "must be within 0-100",
                    ));
                }
                require_finite(&format!("{}.z_offset_um", prefix), channel.z_offset_um)?;
                require_non_negative(
                    &format!("{}.trigger_offset_ms", prefix),
                    channel.trigger_offset_ms,
                )?;
            }
        }

        match self.checked_units() {
            Some(units) if units <= MAX_CAPTURE_UNITS => Ok(()),
            _ => Err(ConfigError::TooManyUnits {
                max: MAX_CAPTURE_UNITS,
            }),
        }
    }

    /// Total capture units, or `None` if the product overflows `u64`
    pub fn checked_units(&self) -> Option<u64> {
        let per_plane = self
            .channel_groups
            .iter()
            .try_fold(0u64, |acc, g| acc.checked_add(g.capture_units() as u64))?;
        (self.regions.len() as u64)
            .checked_mul(self.time_series.points as u64)?
            .checked_mul(self.z_stack.planes as u64)?
            .checked_mul(per_plane)
    }

    /// Scan dimensions
    ///
    /// `units` saturates at `u64::MAX` for configs that `validate` rejects.
    pub fn totals(&self) -> ScanTotals {
        ScanTotals {
            regions: self.regions.len(),
            time_points: self.time_series.points,
            z_planes: self.z_stack.planes,
            channel_groups: self.channel_groups.len(),
            units: self.checked_units().unwrap_or(u64::MAX),
        }
    }
}

fn require_finite(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be finite"))
    }
}

fn require_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    require_finite(field, value)?;
    if value < 0.0 {
        return Err(ConfigError::invalid(field, "must not be negative"));
    }
    Ok(())
}

/// Extent of each scan dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanTotals {
    /// Region count
    pub regions: usize,
    /// Time point count
    pub time_points: u32,
    /// Z-plane count
    pub z_planes: u32,
    /// Channel group count
    pub channel_groups: usize,
    /// Total capture units in the run
    pub units: u64,
}

/// Zero-based position within the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanIndices {
    /// Region index
    pub region: usize,
    /// Time point index
    pub time_point: u32,
    /// Z-plane index
    pub z_plane: u32,
    /// Channel group index
    pub channel_group: usize,
}

impl fmt::Display for ScanIndices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{} t{} z{} g{}",
            self.region, self.time_point, self.z_plane, self.channel_group
        )
    }
}

/// Acquisition workflow phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionPhase {
    /// No run in progress.
    #[default]
    Idle,
    /// Worker spawned, waiting for its readiness signal.
    Starting,
    /// Worker is capturing.
    Running,
    /// Pause requested, worker has not reached a unit boundary yet.
    Pausing,
    /// Worker is parked between units.
    Paused,
    /// Stop requested, worker is finishing its current unit.
    Aborting,
    /// Worker finished all units and is cleaning up.
    Completing,
    /// Run ended successfully.
    Completed,
    /// Run ended with an error or was aborted.
    Failed,
}

impl AcquisitionPhase {
    /// Whether a worker may still be alive in this phase
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AcquisitionPhase::Starting
                | AcquisitionPhase::Running
                | AcquisitionPhase::Pausing
                | AcquisitionPhase::Paused
                | AcquisitionPhase::Aborting
                | AcquisitionPhase::Completing
        )
    }

    /// Whether a stop request can still take effect in this phase
    pub fn is_stoppable(self) -> bool {
        matches!(
            self,
            AcquisitionPhase::Starting
                | AcquisitionPhase::Running
                | AcquisitionPhase::Pausing
                | AcquisitionPhase::Paused
        )
    }

    /// Check whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: AcquisitionPhase) -> bool {
        use AcquisitionPhase::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running | Aborting | Completing | Failed)
                | (Running, Pausing | Aborting | Completing | Failed)
                | (Pausing, Paused | Running | Aborting | Completing | Failed)
                | (Paused, Running | Aborting | Failed)
                | (Aborting, Completed | Failed)
                | (Completing, Completed | Failed)
                | (Completed | Failed, Idle)
        )
    }
}

impl fmt::Display for AcquisitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of the acquisition controller's state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AcquisitionState {
    /// Active run, if any
    pub run_id: Option<RunId>,
    /// Workflow phase
    pub phase: AcquisitionPhase,
    /// Last reported scan position
    pub indices: ScanIndices,
    /// Scan dimensions
    pub totals: ScanTotals,
    /// Capture units completed so far
    pub units_done: u64,
    /// Estimated seconds remaining
    pub eta_s: Option<f64>,
}

impl AcquisitionState {
    /// Fresh state for a run that is about to start
    pub fn starting(run_id: RunId, totals: ScanTotals) -> Self {
        Self {
            run_id: Some(run_id),
            phase: AcquisitionPhase::Starting,
            indices: ScanIndices::default(),
            totals,
            units_done: 0,
            eta_s: None,
        }
    }

    /// Completion percentage, 0-100
    pub fn percent(&self) -> f64 {
        if self.totals.units == 0 {
            0.0
        } else {
            self.units_done as f64 * 100.0 / self.totals.units as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> ChannelSpec {
        ChannelSpec::new(name, 10.0, 488, 50.0)
    }

    fn config() -> AcquisitionConfig {
        AcquisitionConfig::new(
            vec![Region::new("A1", 0.0, 0.0, 1.0), Region::new("A2", 9.0, 0.0, 1.0)],
            vec![ChannelGroup::sequential(
                "fluorescence",
                vec![channel("DAPI"), channel("GFP"), channel("RFP")],
            )],
        )
    }

    #[test]
    fn test_valid_config_totals() {
        let cfg = config();
        assert!(cfg.validate().is_ok());
        let totals = cfg.totals();
        assert_eq!(totals.regions, 2);
        assert_eq!(totals.units, 6);
    }

    #[test]
    fn test_simultaneous_group_counts_once() {
        let mut cfg = config();
        cfg.channel_groups.push(ChannelGroup::simultaneous(
            "sync",
            vec![channel("a"), channel("b")],
        ));
        cfg.z_stack.planes = 3;
        assert_eq!(cfg.totals().units, 2 * 3 * (3 + 1));
    }

    #[test]
    fn test_rejects_empty_and_invalid() {
        assert!(matches!(
            AcquisitionConfig::default().validate(),
            Err(ConfigError::NoRegions)
        ));

        let mut cfg = config();
        cfg.channel_groups[0].channels.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyChannelGroup { .. })
        ));

        let mut cfg = config();
        cfg.regions[1].name = "A1".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateRegion { .. })
        ));

        let mut cfg = config();
        cfg.channel_groups[0].channels[1].intensity_percent = 140.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut cfg = config();
        cfg.channel_groups[0].channels[0].exposure_ms = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.time_series.points = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversized_scan_is_rejected_without_overflow() {
        let mut cfg = config();
        cfg.z_stack.planes = u32::MAX;
        cfg.time_series.points = u32::MAX;
        cfg.regions = (0..8)
            .map(|i| Region::new(format!("R{}", i), i as f64, 0.0, 1.0))
            .collect();
        assert_eq!(cfg.checked_units(), None);
        assert_eq!(cfg.totals().units, u64::MAX);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TooManyUnits {
                max: MAX_CAPTURE_UNITS
            })
        );

        let mut cfg = config();
        cfg.z_stack.planes = 1_000;
        cfg.time_series.points = 10_000;
        assert_eq!(cfg.checked_units(), Some(60_000_000));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooManyUnits { .. })
        ));
    }

    #[test]
    fn test_dispatch_order_sorts_simultaneous_by_offset() {
        let group = ChannelGroup::simultaneous(
            "sync",
            vec![
                channel("late").with_trigger_offset(5.0),
                channel("early").with_trigger_offset(0.5),
                channel("mid").with_trigger_offset(2.0),
            ],
        );
        let names: Vec<&str> = group
            .dispatch_order()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["early", "mid", "late"]);

        let sequential = ChannelGroup::sequential("seq", group.channels.clone());
        let names: Vec<&str> = sequential
            .dispatch_order()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["late", "early", "mid"]);
    }

    #[test]
    fn test_z_offsets() {
        let bottom = ZStack {
            planes: 3,
            step_um: 2.0,
            anchor: ZAnchor::FromBottom,
        };
        assert_eq!(bottom.offset_um(0), 0.0);
        assert_eq!(bottom.offset_um(2), 4.0);

        let center = ZStack {
            anchor: ZAnchor::FromCenter,
            ..bottom
        };
        assert_eq!(center.offset_um(0), -2.0);
        assert_eq!(center.offset_um(1), 0.0);
        assert_eq!(center.offset_um(2), 2.0);
    }

    #[test]
    fn test_phase_transitions() {
        use AcquisitionPhase::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Running.can_transition_to(Pausing));
        assert!(Paused.can_transition_to(Running));
        assert!(Aborting.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Aborting.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
    }
}
