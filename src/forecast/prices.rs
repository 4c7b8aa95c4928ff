use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::PricePoint;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Price points starting in `[start, end)`, ordered by start time
    async fn get_horizon(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        slot_minutes: u32,
    ) -> Result<Vec<PricePoint>>;
}

fn within(points: &[PricePoint], start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Vec<PricePoint> {
    let mut out: Vec<PricePoint> = points
        .iter()
        .filter(|p| p.time_start >= start && p.time_start < end)
        .cloned()
        .collect();
    out.sort_by_key(|p| p.time_start);
    out
}

/// Reads a JSON array of `{time_start, price_eur_per_kwh}` records.
///
/// The parsed file is cached for `ttl`; a daemon picks up a rewritten file
/// once the cache expires.
#[derive(Clone)]
pub struct JsonFilePriceSource {
    path: PathBuf,
    cache: Arc<RwLock<Option<(DateTime<FixedOffset>, Vec<PricePoint>)>>>,
    ttl: Duration,
}

impl JsonFilePriceSource {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            cache: Arc::new(RwLock::new(None)),
            ttl,
        }
    }

    async fn load(&self) -> Result<Vec<PricePoint>> {
        {
            let c = self.cache.read().await;
            if let Some((ts, v)) = &*c {
                if (Local::now().fixed_offset() - *ts).num_seconds() < self.ttl.as_secs() as i64 {
                    return Ok(v.clone());
                }
            }
        }

        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("price file read failed: {}", self.path.display()))?;
        let points: Vec<PricePoint> =
            serde_json::from_str(&body).context("price JSON parse failed")?;
        debug!(path = %self.path.display(), points = points.len(), "price file loaded");

        let mut c = self.cache.write().await;
        *c = Some((Local::now().fixed_offset(), points.clone()));
        Ok(points)
    }
}

#[async_trait]
impl PriceSource for JsonFilePriceSource {
    async fn get_horizon(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        _slot_minutes: u32,
    ) -> Result<Vec<PricePoint>> {
        let points = self.load().await?;
        Ok(within(&points, start, end))
    }
}

/// Fixed in-memory price series
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    points: Vec<PricePoint>,
}

impl StaticPriceSource {
    pub fn new(points: Vec<PricePoint>) -> Self {
        Self { points }
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn get_horizon(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        _slot_minutes: u32,
    ) -> Result<Vec<PricePoint>> {
        Ok(within(&self.points, start, end))
    }
}
