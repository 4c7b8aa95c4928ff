use serde::{Deserialize, Serialize};

/// Percentile and retention settings for battery candidate selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub charge_percentile: f64,
    pub discharge_percentile: f64,
    /// Fraction of the horizon kept as charge candidates
    pub charge_time_percentage: f64,
    /// Fraction of the horizon kept as discharge candidates
    pub discharge_time_percentage: f64,
    /// Zero disables differential eligibility
    pub min_price_differential: f64,
    pub price_history_days: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            charge_percentile: 30.0,
            discharge_percentile: 70.0,
            charge_time_percentage: 0.25,
            discharge_time_percentage: 0.25,
            min_price_differential: 0.0,
            price_history_days: 14,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, pct) in [
            ("charge_percentile", self.charge_percentile),
            ("discharge_percentile", self.discharge_percentile),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(format!("{} must be within [0, 100], got {}", name, pct));
            }
        }
        if self.charge_percentile >= self.discharge_percentile {
            return Err(format!(
                "charge_percentile ({}) must be below discharge_percentile ({})",
                self.charge_percentile, self.discharge_percentile
            ));
        }
        for (name, frac) in [
            ("charge_time_percentage", self.charge_time_percentage),
            ("discharge_time_percentage", self.discharge_time_percentage),
        ] {
            if !(0.0..=1.0).contains(&frac) {
                return Err(format!("{} must be within [0, 1], got {}", name, frac));
            }
        }
        if self.min_price_differential < 0.0 || !self.min_price_differential.is_finite() {
            return Err("min_price_differential must be a non-negative number".into());
        }
        if self.price_history_days == 0 {
            return Err("price_history_days must be at least 1".into());
        }
        Ok(())
    }
}

/// Economic parameters of battery cycling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryEconomics {
    pub round_trip_efficiency: f64,
    /// Wear cost per cycled kWh; zero disables the filter
    pub cycle_cost_eur: f64,
    /// Accepted charge may exceed accepted discharge by this fraction
    pub charge_buffer_fraction: f64,
    /// Predicted usage is reduced by this fraction before sizing discharge slots
    pub discharge_buffer_fraction: f64,
}

impl Default for BatteryEconomics {
    fn default() -> Self {
        Self {
            round_trip_efficiency: 0.9,
            cycle_cost_eur: 0.0,
            charge_buffer_fraction: 0.20,
            discharge_buffer_fraction: 0.20,
        }
    }
}

impl BatteryEconomics {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.round_trip_efficiency > 0.0 && self.round_trip_efficiency <= 1.0) {
            return Err(format!(
                "round_trip_efficiency must be within (0, 1], got {}",
                self.round_trip_efficiency
            ));
        }
        if self.cycle_cost_eur < 0.0 {
            return Err("cycle_cost_eur must not be negative".into());
        }
        if !(0.0..=1.0).contains(&self.charge_buffer_fraction) {
            return Err(format!(
                "charge_buffer_fraction must be within [0, 1], got {}",
                self.charge_buffer_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.discharge_buffer_fraction) {
            return Err(format!(
                "discharge_buffer_fraction must be within [0, 1], got {}",
                self.discharge_buffer_fraction
            ));
        }
        Ok(())
    }
}
