use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;

/// Physical battery parameters plus the latest SOC reading.
///
/// Read-only input to a pass; the simulation works on copies in kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub capacity_kwh: f64,
    pub min_soc_pct: f64,
    pub max_soc_pct: f64,
    pub charge_rate_kw: f64,
    pub current_soc_pct: f64,
    pub round_trip_efficiency: f64,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            min_soc_pct: 20.0,
            max_soc_pct: 90.0,
            charge_rate_kw: 3.0,
            current_soc_pct: 50.0,
            round_trip_efficiency: 0.9,
        }
    }
}

impl BatteryState {
    pub fn stored_kwh(&self) -> f64 {
        self.capacity_kwh * self.current_soc_pct / 100.0
    }

    pub fn min_kwh(&self) -> f64 {
        self.capacity_kwh * self.min_soc_pct / 100.0
    }

    pub fn max_kwh(&self) -> f64 {
        self.capacity_kwh * self.max_soc_pct / 100.0
    }

    pub fn soc_pct_of(&self, kwh: f64) -> f64 {
        if self.capacity_kwh <= 0.0 {
            return 0.0;
        }
        kwh / self.capacity_kwh * 100.0
    }

    /// Returns a copy with a fresh SOC reading
    pub fn with_soc(&self, current_soc_pct: f64) -> Self {
        Self {
            current_soc_pct,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), SchedulingError> {
        if !(self.capacity_kwh > 0.0) {
            return Err(SchedulingError::InvalidConfig(
                "battery capacity_kwh must be positive".into(),
            ));
        }
        if !(self.charge_rate_kw > 0.0) {
            return Err(SchedulingError::InvalidConfig(
                "battery charge_rate_kw must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.min_soc_pct)
            || !(0.0..=100.0).contains(&self.max_soc_pct)
            || self.min_soc_pct > self.max_soc_pct
        {
            return Err(SchedulingError::InvalidConfig(format!(
                "invalid SOC window [{}, {}]",
                self.min_soc_pct, self.max_soc_pct
            )));
        }
        if !(self.round_trip_efficiency > 0.0 && self.round_trip_efficiency <= 1.0) {
            return Err(SchedulingError::InvalidConfig(format!(
                "round_trip_efficiency {} must be in (0, 1]",
                self.round_trip_efficiency
            )));
        }
        Ok(())
    }
}
