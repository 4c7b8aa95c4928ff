use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::domain::DeviceId;

/// Latest state-of-charge reading of a battery, in percent
#[async_trait]
pub trait SocSource: Send + Sync {
    /// `None` when the device has not reported yet
    async fn current_soc_pct(&self, device_id: &str) -> Result<Option<f64>>;
}

/// Readings set by the host process
#[derive(Debug, Default)]
pub struct StaticSocSource {
    readings: RwLock<BTreeMap<DeviceId, f64>>,
}

impl StaticSocSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reading(self, device_id: impl Into<DeviceId>, soc_pct: f64) -> Self {
        self.set(device_id, soc_pct);
        self
    }

    pub fn set(&self, device_id: impl Into<DeviceId>, soc_pct: f64) {
        self.readings.write().insert(device_id.into(), soc_pct);
    }
}

#[async_trait]
impl SocSource for StaticSocSource {
    async fn current_soc_pct(&self, device_id: &str) -> Result<Option<f64>> {
        Ok(self.readings.read().get(device_id).copied())
    }
}

/// JSON object mapping battery ids to SOC percent, rewritten by an external poller
#[derive(Debug, Clone)]
pub struct JsonFileSocSource {
    path: PathBuf,
}

impl JsonFileSocSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SocSource for JsonFileSocSource {
    async fn current_soc_pct(&self, device_id: &str) -> Result<Option<f64>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("SOC file read failed: {}", self.path.display()))?;
        let readings: BTreeMap<String, f64> =
            serde_json::from_str(&body).context("SOC JSON parse failed")?;
        Ok(readings.get(device_id).copied())
    }
}
