use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::constraints::{BatteryEconomics, ThresholdConfig};
use crate::domain::{Horizon, SlotAction};
use crate::error::{PassWarning, SchedulingError};

/// Linear-interpolated percentile (`pct` in `[0, 100]`), `None` for an empty sample
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted: Vec<f64> = values
        .iter()
        .copied()
        .sorted_by_key(|v| OrderedFloat(*v))
        .collect();
    let rank = pct.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Thresholds read from the price-history collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPercentiles {
    pub max_charge_price: f64,
    pub min_discharge_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    History,
    Horizon,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceThresholds {
    pub max_charge_price: f64,
    pub min_discharge_price: f64,
    pub source: ThresholdSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateSlot {
    pub index: usize,
    pub price: f64,
}

/// Threshold-eligible slots of one action, in priority order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSlotSet {
    pub action: SlotAction,
    pub slots: Vec<CandidateSlot>,
}

impl CandidateSlotSet {
    pub fn empty(action: SlotAction) -> Self {
        Self {
            action,
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn indices(&self) -> BTreeSet<usize> {
        self.slots.iter().map(|s| s.index).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSets {
    pub charge: CandidateSlotSet,
    pub discharge: CandidateSlotSet,
}

/// Derives price thresholds and the battery candidate pools
#[derive(Debug, Clone, Default)]
pub struct ThresholdSelector {
    config: ThresholdConfig,
    economics: BatteryEconomics,
}

impl ThresholdSelector {
    pub fn new(config: ThresholdConfig, economics: BatteryEconomics) -> Self {
        Self { config, economics }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Uses the historical distribution when available, the horizon's own prices otherwise
    pub fn thresholds(
        &self,
        history: Result<HistoricalPercentiles, SchedulingError>,
        horizon: &Horizon,
    ) -> (PriceThresholds, Option<PassWarning>) {
        match history {
            Ok(h) => {
                info!(
                    max_charge_price = h.max_charge_price,
                    min_discharge_price = h.min_discharge_price,
                    "using historical price thresholds"
                );
                (
                    PriceThresholds {
                        max_charge_price: h.max_charge_price,
                        min_discharge_price: h.min_discharge_price,
                        source: ThresholdSource::History,
                    },
                    None,
                )
            }
            Err(e) => {
                let prices = horizon.prices();
                let thresholds = PriceThresholds {
                    max_charge_price: percentile(&prices, self.config.charge_percentile)
                        .unwrap_or(f64::NEG_INFINITY),
                    min_discharge_price: percentile(&prices, self.config.discharge_percentile)
                        .unwrap_or(f64::INFINITY),
                    source: ThresholdSource::Horizon,
                };
                warn!(
                    error = %e,
                    max_charge_price = thresholds.max_charge_price,
                    min_discharge_price = thresholds.min_discharge_price,
                    "price history unavailable, using horizon percentiles"
                );
                let reason = match e {
                    SchedulingError::DegradedHistory(reason) => reason,
                    other => other.to_string(),
                };
                (thresholds, Some(PassWarning::DegradedHistory { reason }))
            }
        }
    }

    pub fn candidates(&self, horizon: &Horizon, thresholds: &PriceThresholds) -> CandidateSets {
        let prices = horizon.prices();
        let n = prices.len();
        let diff = self.config.min_price_differential;

        // Most expensive price strictly after / cheapest strictly before each slot
        let mut later_max = vec![f64::NEG_INFINITY; n];
        for i in (0..n.saturating_sub(1)).rev() {
            later_max[i] = later_max[i + 1].max(prices[i + 1]);
        }
        let mut earlier_min = vec![f64::INFINITY; n];
        for i in 1..n {
            earlier_min[i] = earlier_min[i - 1].min(prices[i - 1]);
        }

        let mut charge = Vec::new();
        let mut discharge = Vec::new();
        for (i, &price) in prices.iter().enumerate() {
            let by_differential = diff > 0.0;
            let charge_ok = price <= thresholds.max_charge_price
                || (by_differential && later_max[i] >= price + diff);
            let discharge_ok = price >= thresholds.min_discharge_price
                || (by_differential && price >= earlier_min[i] + diff);

            let slot = CandidateSlot { index: i, price };
            if discharge_ok {
                if charge_ok {
                    debug!(slot = i, price, "slot eligible for both actions, keeping discharge");
                }
                discharge.push(slot);
            } else if charge_ok {
                charge.push(slot);
            }
        }

        if self.economics.cycle_cost_eur > 0.0 {
            if let Some(cheapest) = charge.iter().map(|s| OrderedFloat(s.price)).min() {
                let floor = cheapest.0 / self.economics.round_trip_efficiency + self.economics.cycle_cost_eur;
                let before = discharge.len();
                discharge.retain(|s| s.price > floor);
                debug!(floor, dropped = before - discharge.len(), "cycle cost filter applied");
            }
        }

        charge.sort_by_key(|s| (OrderedFloat(s.price), s.index));
        discharge.sort_by_key(|s| (Reverse(OrderedFloat(s.price)), s.index));

        let charge_keep = retention(n, self.config.charge_time_percentage);
        let discharge_keep = retention(n, self.config.discharge_time_percentage);
        charge.truncate(charge_keep);
        discharge.truncate(discharge_keep);

        info!(
            charge = charge.len(),
            discharge = discharge.len(),
            charge_keep,
            discharge_keep,
            "battery candidates selected"
        );
        CandidateSets {
            charge: CandidateSlotSet {
                action: SlotAction::Charge,
                slots: charge,
            },
            discharge: CandidateSlotSet {
                action: SlotAction::Discharge,
                slots: discharge,
            },
        }
    }
}

/// `floor(horizon_size * fraction)`
fn retention(horizon_size: usize, fraction: f64) -> usize {
    (horizon_size as f64 * fraction.clamp(0.0, 1.0) + 1e-9).floor() as usize
}
