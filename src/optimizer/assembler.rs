use chrono::{DateTime, FixedOffset};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{ActionWindow, DeviceTimeline, Horizon, Schedule, ScheduleDecision};

pub const OPTIMIZER_VERSION: &str = concat!("price-scheduler-", env!("CARGO_PKG_VERSION"));

/// Collapses per-slot decisions into contiguous action windows
pub struct ScheduleAssembler;

impl ScheduleAssembler {
    /// One window per run of consecutive active slots
    pub fn windows(decision: &ScheduleDecision, horizon: &Horizon) -> Vec<ActionWindow> {
        let active: Vec<usize> = decision
            .active_slots()
            .into_iter()
            .filter(|&i| i < horizon.len())
            .collect();

        let mut windows = Vec::new();
        for (_, run) in &active.iter().enumerate().chunk_by(|(pos, idx)| **idx - *pos) {
            let run: Vec<usize> = run.map(|(_, &idx)| idx).collect();
            let (Some(&first), Some(&last)) = (run.first(), run.last()) else {
                continue;
            };
            let (Some(start_slot), Some(end_slot)) = (horizon.slot(first), horizon.slot(last)) else {
                continue;
            };
            let energy_kwh = match decision {
                ScheduleDecision::Thermal { .. } => None,
                ScheduleDecision::Battery { .. } => Some(
                    run.iter()
                        .filter_map(|&i| decision.flow(i))
                        .map(f64::abs)
                        .sum::<f64>(),
                ),
            };
            windows.push(ActionWindow {
                device_id: decision.device_id().to_string(),
                action: decision.action(),
                start: start_slot.start,
                end: end_slot.end(),
                slots: first..last + 1,
                energy_kwh,
            });
        }
        windows
    }

    /// Builds the per-device timelines of a pass, ordered by device id then start
    pub fn assemble(
        decisions: &[ScheduleDecision],
        horizon: &Horizon,
        created_at: DateTime<FixedOffset>,
    ) -> Schedule {
        let mut by_device: BTreeMap<String, Vec<ActionWindow>> = BTreeMap::new();
        for decision in decisions {
            by_device
                .entry(decision.device_id().to_string())
                .or_default()
                .extend(Self::windows(decision, horizon));
        }

        let timelines: Vec<DeviceTimeline> = by_device
            .into_iter()
            .map(|(device_id, mut windows)| {
                windows.sort_by_key(|w| (w.start, w.action));
                DeviceTimeline { device_id, windows }
            })
            .collect();

        debug!(
            devices = timelines.len(),
            windows = timelines.iter().map(|t| t.windows.len()).sum::<usize>(),
            "schedule assembled"
        );

        Schedule {
            id: Uuid::new_v4(),
            created_at,
            valid_from: horizon.start().unwrap_or(created_at),
            valid_until: horizon.end().unwrap_or(created_at),
            timelines,
            optimizer_version: OPTIMIZER_VERSION.to_string(),
        }
    }
}
