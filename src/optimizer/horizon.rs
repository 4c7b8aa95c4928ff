use chrono::{DateTime, Duration, FixedOffset};
use tracing::debug;

use crate::domain::{Horizon, PricePoint, PriceSlot};
use crate::error::SchedulingError;

/// Builds the immutable slot grid of a pass from raw price points
pub struct HorizonBuilder;

impl HorizonBuilder {
    /// Points outside `[start, end)` are ignored. The remaining points must start at
    /// `start`, sit exactly on slot boundaries and cover the span without gaps or duplicates.
    pub fn build(
        points: &[PricePoint],
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        slot_minutes: u32,
    ) -> Result<Horizon, SchedulingError> {
        if slot_minutes == 0 {
            return Err(SchedulingError::IncompleteHorizon(
                "slot duration must be positive".into(),
            ));
        }
        if end <= start {
            return Err(SchedulingError::IncompleteHorizon(format!(
                "empty span {} .. {}",
                start, end
            )));
        }

        let step = Duration::minutes(i64::from(slot_minutes));
        let mut in_span: Vec<&PricePoint> = points
            .iter()
            .filter(|p| p.time_start >= start && p.time_start < end)
            .collect();
        in_span.sort_by_key(|p| p.time_start);

        let mut slots = Vec::with_capacity(in_span.len());
        let mut expected = start;
        for point in in_span {
            if point.time_start < expected {
                return Err(SchedulingError::IncompleteHorizon(format!(
                    "duplicate or misaligned price at {}",
                    point.time_start
                )));
            }
            if point.time_start > expected {
                return Err(SchedulingError::IncompleteHorizon(format!(
                    "missing price for slot starting {}",
                    expected
                )));
            }
            if !point.price_eur_per_kwh.is_finite() {
                return Err(SchedulingError::IncompleteHorizon(format!(
                    "non-finite price at {}",
                    point.time_start
                )));
            }
            slots.push(PriceSlot {
                index: slots.len(),
                start: point.time_start,
                price: point.price_eur_per_kwh,
                duration_minutes: slot_minutes,
            });
            expected += step;
        }

        if expected < end {
            return Err(SchedulingError::IncompleteHorizon(format!(
                "prices end at {}, span requires {}",
                expected, end
            )));
        }
        if expected > end {
            return Err(SchedulingError::IncompleteHorizon(format!(
                "span {} .. {} is not a whole number of {}-minute slots",
                start, end, slot_minutes
            )));
        }

        debug!(slots = slots.len(), slot_minutes, "horizon built");
        Ok(Horizon::from_validated_slots(slots, slot_minutes))
    }

    /// Builds a horizon covering every supplied point, starting at the first one
    pub fn from_points(points: &[PricePoint], slot_minutes: u32) -> Result<Horizon, SchedulingError> {
        let start = points
            .iter()
            .map(|p| p.time_start)
            .min()
            .ok_or_else(|| SchedulingError::IncompleteHorizon("no price points".into()))?;
        let last = points
            .iter()
            .map(|p| p.time_start)
            .max()
            .unwrap_or(start);
        let end = last + Duration::minutes(i64::from(slot_minutes));
        Self::build(points, start, end, slot_minutes)
    }
}
