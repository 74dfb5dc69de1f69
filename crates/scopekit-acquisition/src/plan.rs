//! Scan plan: the ordered capture units for one run.
//!
//! Nesting is region → time point → z-plane → channel group. A sequential
//! group contributes one unit per channel; a simultaneous group contributes a
//! single unit whose channels are sorted by trigger offset.

use scopekit_core::data::{AcquisitionConfig, ChannelSpec, GroupMode, ScanIndices};

/// One atomic capture: cancellation and pause are only honored between units
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureUnit {
    /// Zero-based position of this unit in the run
    pub ordinal: u64,
    /// Scan position
    pub indices: ScanIndices,
    /// Channels to light, in dispatch order
    pub channels: Vec<ChannelSpec>,
    /// Display label (channel name or group name)
    pub label: String,
    /// First unit of a (region, time point) visit: move XY and maybe focus
    pub starts_visit: bool,
    /// First unit of a z-plane: move Z
    pub starts_plane: bool,
}

/// Ordered capture units for a configuration
///
/// Units are produced on demand, so memory does not grow with the run length.
#[derive(Debug, Clone, Copy)]
pub struct ScanPlan<'a> {
    config: &'a AcquisitionConfig,
}

impl<'a> ScanPlan<'a> {
    /// Plan a configuration
    pub fn new(config: &'a AcquisitionConfig) -> Self {
        Self { config }
    }

    /// Units in execution order
    pub fn iter(&self) -> ScanUnits<'a> {
        let config = self.config;
        ScanUnits {
            config,
            region: 0,
            time_point: 0,
            z_plane: 0,
            group: 0,
            channel: 0,
            first_in_plane: true,
            ordinal: 0,
            done: config.regions.is_empty()
                || config.time_series.points == 0
                || config.z_stack.planes == 0,
        }
    }

    /// Number of units
    pub fn len(&self) -> u64 {
        self.config.totals().units
    }

    /// Whether the plan has no units
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cursor over region, time point, z-plane, group and channel
#[derive(Debug, Clone)]
pub struct ScanUnits<'a> {
    config: &'a AcquisitionConfig,
    region: usize,
    time_point: u32,
    z_plane: u32,
    group: usize,
    channel: usize,
    first_in_plane: bool,
    ordinal: u64,
    done: bool,
}

impl ScanUnits<'_> {
    fn next_plane(&mut self) {
        self.group = 0;
        self.channel = 0;
        self.first_in_plane = true;
        self.z_plane += 1;
        if self.z_plane < self.config.z_stack.planes {
            return;
        }
        self.z_plane = 0;
        self.time_point += 1;
        if self.time_point < self.config.time_series.points {
            return;
        }
        self.time_point = 0;
        self.region += 1;
        if self.region >= self.config.regions.len() {
            self.done = true;
        }
    }

    fn emit(&mut self, label: String, channels: Vec<ChannelSpec>) -> CaptureUnit {
        let unit = CaptureUnit {
            ordinal: self.ordinal,
            indices: ScanIndices {
                region: self.region,
                time_point: self.time_point,
                z_plane: self.z_plane,
                channel_group: self.group,
            },
            channels,
            label,
            starts_visit: self.first_in_plane && self.z_plane == 0,
            starts_plane: self.first_in_plane,
        };
        self.ordinal += 1;
        self.first_in_plane = false;
        unit
    }
}

impl Iterator for ScanUnits<'_> {
    type Item = CaptureUnit;

    fn next(&mut self) -> Option<CaptureUnit> {
        let config = self.config;
        while !self.done {
            let Some(group) = config.channel_groups.get(self.group) else {
                self.next_plane();
                continue;
            };
            match group.mode {
                GroupMode::Sequential => {
                    if let Some(channel) = group.channels.get(self.channel) {
                        self.channel += 1;
                        return Some(self.emit(channel.name.clone(), vec![channel.clone()]));
                    }
                }
                GroupMode::Simultaneous => {
                    if self.channel == 0 && !group.channels.is_empty() {
                        self.channel = 1;
                        let channels = group.dispatch_order().into_iter().cloned().collect();
                        return Some(self.emit(group.name.clone(), channels));
                    }
                }
            }
            self.group += 1;
            self.channel = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scopekit_core::data::{ChannelGroup, Region};

    fn channel(name: &str, offset: f64) -> ChannelSpec {
        ChannelSpec::new(name, 5.0, 488, 30.0).with_trigger_offset(offset)
    }

    #[test]
    fn test_six_unit_plan() {
        let config = AcquisitionConfig::new(
            vec![Region::new("A1", 1.0, 1.0, 1.0), Region::new("A2", 2.0, 1.0, 1.0)],
            vec![ChannelGroup::sequential(
                "fluo",
                vec![channel("DAPI", 0.0), channel("GFP", 0.0), channel("RFP", 0.0)],
            )],
        );
        let plan = ScanPlan::new(&config);
        assert_eq!(plan.len(), 6);
        let units: Vec<CaptureUnit> = plan.iter().collect();
        let labels: Vec<&str> = units.iter().map(|u| u.label.as_str()).collect();
        assert_eq!(labels, vec!["DAPI", "GFP", "RFP", "DAPI", "GFP", "RFP"]);
        let visits: Vec<bool> = units.iter().map(|u| u.starts_visit).collect();
        assert_eq!(visits, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn test_simultaneous_group_is_one_sorted_unit() {
        let mut config = AcquisitionConfig::new(
            vec![Region::new("A1", 1.0, 1.0, 1.0)],
            vec![ChannelGroup::simultaneous(
                "sync",
                vec![channel("late", 3.0), channel("early", 1.0)],
            )],
        );
        config.z_stack.planes = 2;
        let plan = ScanPlan::new(&config);
        assert_eq!(plan.len(), 2);
        let units: Vec<CaptureUnit> = plan.iter().collect();
        let names: Vec<&str> = units[0].channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
        assert!(units[1].starts_plane);
        assert!(!units[1].starts_visit);
    }

    #[test]
    fn test_huge_plan_is_not_materialized() {
        let mut config = AcquisitionConfig::new(
            vec![Region::new("A1", 1.0, 1.0, 1.0)],
            vec![ChannelGroup::sequential("fluo", vec![channel("GFP", 0.0)])],
        );
        config.z_stack.planes = u32::MAX;
        config.time_series.points = u32::MAX;
        let plan = ScanPlan::new(&config);
        assert_eq!(plan.len(), u32::MAX as u64 * u32::MAX as u64);

        let last = plan.iter().take(3).last().map(|u| (u.ordinal, u.indices.z_plane));
        assert_eq!(last, Some((2, 2)));
    }

    #[test]
    fn test_empty_groups_yield_nothing() {
        let mut config = AcquisitionConfig::new(
            vec![Region::new("A1", 1.0, 1.0, 1.0)],
            vec![
                ChannelGroup::sequential("empty", Vec::new()),
                ChannelGroup::simultaneous("also empty", Vec::new()),
            ],
        );
        config.z_stack.planes = 3;
        assert_eq!(plan_units(&config), 0);

        config.time_series.points = 0;
        assert!(ScanPlan::new(&config).iter().next().is_none());
    }

    fn plan_units(config: &AcquisitionConfig) -> usize {
        ScanPlan::new(config).iter().count()
    }

    fn arb_config() -> impl Strategy<Value = AcquisitionConfig> {
        (
            1usize..4,
            1u32..3,
            1u32..4,
            prop::collection::vec(
                (any::<bool>(), prop::collection::vec(0.0f64..10.0, 1..4)),
                1..4,
            ),
        )
            .prop_map(|(regions, points, planes, groups)| {
                let regions = (0..regions)
                    .map(|i| Region::new(format!("R{}", i), i as f64, 0.0, 1.0))
                    .collect();
                let groups = groups
                    .into_iter()
                    .enumerate()
                    .map(|(g, (simultaneous, offsets))| {
                        let channels = offsets
                            .into_iter()
                            .enumerate()
                            .map(|(c, offset)| channel(&format!("g{}c{}", g, c), offset))
                            .collect();
                        if simultaneous {
                            ChannelGroup::simultaneous(format!("g{}", g), channels)
                        } else {
                            ChannelGroup::sequential(format!("g{}", g), channels)
                        }
                    })
                    .collect();
                let mut config = AcquisitionConfig::new(regions, groups);
                config.time_series.points = points;
                config.z_stack.planes = planes;
                config
            })
    }

    proptest! {
        #[test]
        fn plan_matches_totals_and_order(config in arb_config()) {
            let plan = ScanPlan::new(&config);
            let units: Vec<CaptureUnit> = plan.iter().collect();
            prop_assert_eq!(units.len() as u64, plan.len());
            prop_assert_eq!(plan.len(), config.totals().units);

            let mut previous: Option<&CaptureUnit> = None;
            for (i, unit) in units.iter().enumerate() {
                prop_assert_eq!(unit.ordinal, i as u64);
                for pair in unit.channels.windows(2) {
                    prop_assert!(pair[0].trigger_offset_ms <= pair[1].trigger_offset_ms);
                }
                if let Some(prev) = previous {
                    let key = |u: &CaptureUnit| (
                        u.indices.region,
                        u.indices.time_point,
                        u.indices.z_plane,
                        u.indices.channel_group,
                    );
                    prop_assert!(key(prev) <= key(unit));
                }
                previous = Some(unit);
            }

            let visits = units.iter().filter(|u| u.starts_visit).count();
            prop_assert_eq!(
                visits,
                config.regions.len() * config.time_series.points as usize
            );
        }
    }
}
