use chrono::{DateTime, Duration, FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stable identifier of a controllable device (e.g. `heat_pump`, `battery`)
pub type DeviceId = String;

// ============================================================================
// Device Kinds
// ============================================================================

/// Kind of controllable load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    HeatPump,
    HotWater,
    Battery,
}

impl DeviceKind {
    /// Block-run devices planned by the thermal scheduler
    pub fn is_thermal(&self) -> bool {
        matches!(self, DeviceKind::HeatPump | DeviceKind::HotWater)
    }
}

/// What a device does during an active slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotAction {
    Run,
    Charge,
    Discharge,
}

// ============================================================================
// Prices and Slots
// ============================================================================

/// Raw price point as delivered by a price source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub time_start: DateTime<FixedOffset>,
    #[serde(alias = "price")]
    pub price_eur_per_kwh: f64,
}

impl PricePoint {
    pub fn new(time_start: DateTime<FixedOffset>, price_eur_per_kwh: f64) -> Self {
        Self {
            time_start,
            price_eur_per_kwh,
        }
    }
}

/// One fixed-duration slot of a horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSlot {
    pub index: usize,
    pub start: DateTime<FixedOffset>,
    pub price: f64,
    pub duration_minutes: u32,
}

impl PriceSlot {
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn end(&self) -> DateTime<FixedOffset> {
        self.start + self.duration()
    }

    /// Slot length in hours, used to turn kW into kWh
    pub fn hours(&self) -> f64 {
        f64::from(self.duration_minutes) / 60.0
    }

    pub fn contains(&self, t: DateTime<FixedOffset>) -> bool {
        t >= self.start && t < self.end()
    }
}

/// Ordered, gapless slot grid for one optimization pass.
///
/// Only [`crate::optimizer::HorizonBuilder`] creates horizons, so the
/// contiguity invariant holds for every instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Horizon {
    slots: Vec<PriceSlot>,
    slot_minutes: u32,
}

impl Horizon {
    pub(crate) fn from_validated_slots(slots: Vec<PriceSlot>, slot_minutes: u32) -> Self {
        Self {
            slots,
            slot_minutes,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[PriceSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&PriceSlot> {
        self.slots.get(index)
    }

    pub fn slot_minutes(&self) -> u32 {
        self.slot_minutes
    }

    pub fn slot_hours(&self) -> f64 {
        f64::from(self.slot_minutes) / 60.0
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.slot_minutes))
    }

    /// Start of the first slot
    pub fn start(&self) -> Option<DateTime<FixedOffset>> {
        self.slots.first().map(|s| s.start)
    }

    /// End of the last slot (exclusive)
    pub fn end(&self) -> Option<DateTime<FixedOffset>> {
        self.slots.last().map(|s| s.end())
    }

    pub fn prices(&self) -> Vec<f64> {
        self.slots.iter().map(|s| s.price).collect()
    }

    /// Index of the slot containing `t`, if `t` lies inside the horizon
    pub fn index_of(&self, t: DateTime<FixedOffset>) -> Option<usize> {
        let start = self.start()?;
        if t < start {
            return None;
        }
        let offset_minutes = (t - start).num_minutes();
        let index = usize::try_from(offset_minutes / i64::from(self.slot_minutes)).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    pub fn slot_at(&self, t: DateTime<FixedOffset>) -> Option<&PriceSlot> {
        self.index_of(t).and_then(|i| self.slots.get(i))
    }

    /// Number of slots whose start precedes `now`. Those slots are immutable.
    pub fn first_future_index(&self, now: DateTime<FixedOffset>) -> usize {
        self.slots.partition_point(|s| s.start < now)
    }
}

// ============================================================================
// Allowed Windows
// ============================================================================

/// Time-of-day window a thermal device may run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllowedWindow {
    #[default]
    Always,
    /// Daily window `[from, to)` in the slot's own offset; wraps past midnight when `to <= from`
    Daily { from: NaiveTime, to: NaiveTime },
}

impl AllowedWindow {
    pub fn permits(&self, slot: &PriceSlot) -> bool {
        match self {
            AllowedWindow::Always => true,
            AllowedWindow::Daily { from, to } => {
                let t = slot.start.time();
                if from < to {
                    t >= *from && t < *to
                } else {
                    t >= *from || t < *to
                }
            }
        }
    }
}
