use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use uuid::Uuid;

use super::types::{DeviceId, SlotAction};

/// Per-slot result of one device for one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleDecision {
    /// Active slot indices of a block-run device
    Thermal {
        device_id: DeviceId,
        active: BTreeSet<usize>,
    },
    /// Signed energy per slot in kWh: positive charges, negative discharges
    Battery {
        device_id: DeviceId,
        action: SlotAction,
        flows: BTreeMap<usize, f64>,
    },
}

impl ScheduleDecision {
    pub fn device_id(&self) -> &str {
        match self {
            ScheduleDecision::Thermal { device_id, .. } => device_id,
            ScheduleDecision::Battery { device_id, .. } => device_id,
        }
    }

    pub fn action(&self) -> SlotAction {
        match self {
            ScheduleDecision::Thermal { .. } => SlotAction::Run,
            ScheduleDecision::Battery { action, .. } => *action,
        }
    }

    pub fn active_slots(&self) -> BTreeSet<usize> {
        match self {
            ScheduleDecision::Thermal { active, .. } => active.clone(),
            ScheduleDecision::Battery { flows, .. } => flows.keys().copied().collect(),
        }
    }

    pub fn is_active(&self, index: usize) -> bool {
        match self {
            ScheduleDecision::Thermal { active, .. } => active.contains(&index),
            ScheduleDecision::Battery { flows, .. } => flows.contains_key(&index),
        }
    }

    /// Signed flow of a slot; thermal decisions have none
    pub fn flow(&self, index: usize) -> Option<f64> {
        match self {
            ScheduleDecision::Thermal { .. } => None,
            ScheduleDecision::Battery { flows, .. } => flows.get(&index).copied(),
        }
    }

    /// Key the decision is persisted under. Battery actions lock independently.
    pub fn state_key(&self) -> String {
        match self {
            ScheduleDecision::Thermal { device_id, .. } => device_id.clone(),
            ScheduleDecision::Battery {
                device_id, action, ..
            } => battery_state_key(device_id, *action),
        }
    }
}

pub fn battery_state_key(device_id: &str, action: SlotAction) -> String {
    format!("{}_{}", device_id, action)
}

/// One contiguous run of active slots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionWindow {
    pub device_id: DeviceId,
    pub action: SlotAction,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub slots: Range<usize>,
    /// Total absolute energy moved, battery windows only
    pub energy_kwh: Option<f64>,
}

impl ActionWindow {
    pub fn contains(&self, t: DateTime<FixedOffset>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Ordered action windows of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTimeline {
    pub device_id: DeviceId,
    pub windows: Vec<ActionWindow>,
}

impl DeviceTimeline {
    pub fn action_at(&self, t: DateTime<FixedOffset>) -> Option<SlotAction> {
        self.windows.iter().find(|w| w.contains(t)).map(|w| w.action)
    }
}

/// Output of a pass handed to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub created_at: DateTime<FixedOffset>,
    pub valid_from: DateTime<FixedOffset>,
    pub valid_until: DateTime<FixedOffset>,
    pub timelines: Vec<DeviceTimeline>,
    pub optimizer_version: String,
}

impl Schedule {
    pub fn timeline(&self, device_id: &str) -> Option<&DeviceTimeline> {
        self.timelines.iter().find(|t| t.device_id == device_id)
    }

    pub fn windows(&self) -> impl Iterator<Item = &ActionWindow> {
        self.timelines.iter().flat_map(|t| t.windows.iter())
    }

    /// Windows of all devices that have not ended by `now`
    pub fn upcoming(&self, now: DateTime<FixedOffset>) -> Vec<&ActionWindow> {
        self.windows().filter(|w| w.end > now).collect()
    }
}

/// Record kept per device (or battery action) between passes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDeviceState {
    #[serde(skip)]
    pub device_id: DeviceId,
    #[serde(default)]
    pub last_run_end: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub locked_starts: Vec<DateTime<FixedOffset>>,
}

impl PersistedDeviceState {
    pub fn empty(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }
}
