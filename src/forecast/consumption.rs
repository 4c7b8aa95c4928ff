use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::Timelike;

use crate::domain::{Horizon, PriceSlot};

#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Predicted household consumption during `slot`, in kWh
    async fn predicted_usage(&self, slot: &PriceSlot) -> Option<f64>;

    /// Per-slot predictions for a whole horizon, indexed like its slots
    async fn usage_for(&self, horizon: &Horizon) -> Vec<Option<f64>> {
        let mut out = Vec::with_capacity(horizon.len());
        for slot in horizon.slots() {
            out.push(self.predicted_usage(slot).await);
        }
        out
    }
}

/// No forecast available; discharge is limited by the charge rate only
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForecast;

#[async_trait]
impl ForecastSource for NoForecast {
    async fn predicted_usage(&self, _slot: &PriceSlot) -> Option<f64> {
        None
    }
}

/// Average load per local hour of day, in kW
#[derive(Debug, Clone)]
pub struct HourlyProfileForecast {
    load_kw: [f64; 24],
}

impl HourlyProfileForecast {
    pub fn new(load_kw: Vec<f64>) -> Result<Self> {
        ensure!(
            load_kw.len() == 24,
            "hourly profile needs 24 values, got {}",
            load_kw.len()
        );
        ensure!(
            load_kw.iter().all(|v| v.is_finite() && *v >= 0.0),
            "hourly profile values must be finite and non-negative"
        );
        let mut profile = [0.0; 24];
        profile.copy_from_slice(&load_kw);
        Ok(Self { load_kw: profile })
    }

    /// Flat base load with morning and evening peaks
    pub fn household() -> Self {
        let mut load_kw = [0.0; 24];
        for (h, v) in load_kw.iter_mut().enumerate() {
            let hh = h as f64;
            *v = 0.6 + bump(hh, 7.5, 1.5) + bump(hh, 18.5, 2.0) * 1.6;
        }
        Self { load_kw }
    }
}

fn bump(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma.max(0.01);
    (-0.5 * z * z).exp()
}

#[async_trait]
impl ForecastSource for HourlyProfileForecast {
    async fn predicted_usage(&self, slot: &PriceSlot) -> Option<f64> {
        let hour = slot.start.hour() as usize;
        self.load_kw.get(hour).map(|kw| kw * slot.hours())
    }
}
