use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Local};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::PricePoint;
use crate::optimizer::percentile;

/// Fewer recorded prices than this are not a distribution worth trusting
pub const MIN_HISTORY_POINTS: usize = 24;

#[async_trait]
pub trait PriceHistorySource: Send + Sync {
    /// `pct` percentile (0..=100) of the prices of the last `days` days.
    /// An error means the history is unavailable.
    async fn percentile(&self, days: u32, pct: f64) -> Result<f64>;
}

fn recent_percentile(
    points: &[PricePoint],
    now: DateTime<FixedOffset>,
    days: u32,
    pct: f64,
) -> Result<f64> {
    let since = now - Duration::days(i64::from(days));
    let prices: Vec<f64> = points
        .iter()
        .filter(|p| p.time_start >= since && p.time_start <= now)
        .map(|p| p.price_eur_per_kwh)
        .filter(|p| p.is_finite())
        .collect();
    if prices.len() < MIN_HISTORY_POINTS {
        bail!(
            "only {} price(s) recorded in the last {} day(s), need {}",
            prices.len(),
            days,
            MIN_HISTORY_POINTS
        );
    }
    percentile(&prices, pct).context("empty price history")
}

/// Historical prices kept as a JSON array of price points
#[derive(Debug, Clone)]
pub struct JsonFilePriceHistory {
    path: PathBuf,
}

impl JsonFilePriceHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PriceHistorySource for JsonFilePriceHistory {
    async fn percentile(&self, days: u32, pct: f64) -> Result<f64> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("price history read failed: {}", self.path.display()))?;
        let points: Vec<PricePoint> =
            serde_json::from_str(&body).context("price history JSON parse failed")?;
        let value = recent_percentile(&points, Local::now().fixed_offset(), days, pct)?;
        debug!(days, pct, value, "historical percentile");
        Ok(value)
    }
}

/// In-memory history, or a permanently unavailable one
#[derive(Debug, Clone, Default)]
pub struct StaticPriceHistory {
    prices: Option<Vec<f64>>,
}

impl StaticPriceHistory {
    pub fn new(prices: Vec<f64>) -> Self {
        Self {
            prices: Some(prices),
        }
    }

    pub fn unavailable() -> Self {
        Self { prices: None }
    }
}

#[async_trait]
impl PriceHistorySource for StaticPriceHistory {
    async fn percentile(&self, _days: u32, pct: f64) -> Result<f64> {
        match &self.prices {
            Some(prices) if prices.len() >= MIN_HISTORY_POINTS => {
                percentile(prices, pct).context("empty price history")
            }
            Some(prices) => bail!("only {} price(s) recorded", prices.len()),
            None => bail!("price history source unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly(now: DateTime<FixedOffset>, hours: i64) -> Vec<PricePoint> {
        (0..hours)
            .map(|h| PricePoint::new(now - Duration::hours(h), h as f64 / 100.0))
            .collect()
    }

    #[test]
    fn test_recent_percentile_uses_window_only() {
        let now = Local::now().fixed_offset();
        let mut points = hourly(now, 48);
        // Far outside a one-day window
        points.push(PricePoint::new(now - Duration::days(30), 100.0));
        let max = recent_percentile(&points, now, 1, 100.0).unwrap();
        assert!((max - 0.24).abs() < 1e-12);
    }

    #[test]
    fn test_sparse_history_is_unavailable() {
        let now = Local::now().fixed_offset();
        let err = recent_percentile(&hourly(now, 10), now, 14, 30.0).unwrap_err();
        assert!(err.to_string().contains("need 24"));
    }

    #[tokio::test]
    async fn test_static_history() {
        let history = StaticPriceHistory::new((0..=100).map(|i| i as f64 / 100.0).collect());
        let p30 = history.percentile(14, 30.0).await.unwrap();
        assert!((p30 - 0.30).abs() < 1e-12);
        assert!(StaticPriceHistory::unavailable().percentile(14, 30.0).await.is_err());
    }

    #[tokio::test]
    async fn test_json_history_file() {
        let now = Local::now().fixed_offset();
        let path = std::env::temp_dir().join(format!("history-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, serde_json::to_string(&hourly(now, 72)).unwrap())
            .await
            .unwrap();
        let history = JsonFilePriceHistory::new(&path);
        let min = history.percentile(14, 0.0).await.unwrap();
        assert_eq!(min, 0.0);
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(history.percentile(14, 0.0).await.is_err());
    }
}
