use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::{AllowedWindow, DeviceId, DeviceKind};

/// Input to the thermal scheduler for one block-run device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceScheduleRequest {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    /// Required run time over the horizon
    pub block_minutes: u32,
    /// `ceil(block_minutes / slot_minutes)`
    pub blocks_required: usize,
    /// Inactive slots that must separate two runs
    pub min_gap_slots: usize,
    /// Longest idle stretch tolerated between runs
    #[serde(default)]
    pub max_gap_slots: Option<usize>,
    #[serde(default)]
    pub allowed_window: AllowedWindow,
    #[serde(default)]
    pub locked_slot_indices: BTreeSet<usize>,
    /// Slots elapsed since the previous run ended, as seen from horizon start
    #[serde(default)]
    pub initial_gap_slots: Option<usize>,
}

impl DeviceScheduleRequest {
    pub fn new(
        device_id: impl Into<DeviceId>,
        kind: DeviceKind,
        block_minutes: u32,
        slot_minutes: u32,
        min_gap_slots: usize,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            block_minutes,
            blocks_required: blocks_for(block_minutes, slot_minutes),
            min_gap_slots,
            max_gap_slots: None,
            allowed_window: AllowedWindow::Always,
            locked_slot_indices: BTreeSet::new(),
            initial_gap_slots: None,
        }
    }

    pub fn with_locks(mut self, locked: BTreeSet<usize>) -> Self {
        self.locked_slot_indices = locked;
        self
    }

    pub fn with_initial_gap(mut self, gap: usize) -> Self {
        self.initial_gap_slots = Some(gap);
        self
    }

    pub fn with_max_gap(mut self, max_gap: usize) -> Self {
        self.max_gap_slots = Some(max_gap);
        self
    }

    pub fn with_window(mut self, window: AllowedWindow) -> Self {
        self.allowed_window = window;
        self
    }
}

/// Number of slots needed to cover `block_minutes`, rounded up
pub fn blocks_for(block_minutes: u32, slot_minutes: u32) -> usize {
    if slot_minutes == 0 {
        return 0;
    }
    block_minutes.div_ceil(slot_minutes) as usize
}
