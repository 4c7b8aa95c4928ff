use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::{Dispatcher, PassKind, PassReport, Planner};
use crate::config::PlannerConfig;

/// Periodic task configuration
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Full re-plan interval
    pub full_pass_interval: Duration,
    /// Battery re-limit interval
    pub battery_pass_interval: Duration,
}

impl Default for PeriodicTaskConfig {
    fn default() -> Self {
        Self::from(&PlannerConfig::default())
    }
}

impl From<&PlannerConfig> for PeriodicTaskConfig {
    fn from(cfg: &PlannerConfig) -> Self {
        Self {
            full_pass_interval: Duration::from_secs(cfg.full_pass_every_minutes.max(1) * 60),
            battery_pass_interval: Duration::from_secs(cfg.battery_pass_every_minutes.max(1) * 60),
        }
    }
}

/// Task status tracking
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Drives the two pass cadences and hands every schedule to the dispatcher
pub struct TaskScheduler {
    config: PeriodicTaskConfig,
    planner: Arc<Planner>,
    dispatcher: Arc<dyn Dispatcher>,
    full_status: Arc<RwLock<TaskStatus>>,
    battery_status: Arc<RwLock<TaskStatus>>,
}

impl TaskScheduler {
    pub fn new(planner: Arc<Planner>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::with_config(planner, dispatcher, PeriodicTaskConfig::default())
    }

    pub fn with_config(planner: Arc<Planner>, dispatcher: Arc<dyn Dispatcher>, config: PeriodicTaskConfig) -> Self {
        Self {
            config,
            planner,
            dispatcher,
            full_status: Arc::new(RwLock::new(TaskStatus::default())),
            battery_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Starts both loops. The full pass runs immediately, the battery pass one interval later.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let scheduler = self.clone();
        let full = tokio::spawn(async move {
            scheduler.run_full_pass_task().await;
        });

        let scheduler = self.clone();
        let battery = tokio::spawn(async move {
            scheduler.run_battery_pass_task().await;
        });

        info!(
            full_every_secs = self.config.full_pass_interval.as_secs(),
            battery_every_secs = self.config.battery_pass_interval.as_secs(),
            "periodic passes started"
        );
        vec![full, battery]
    }

    async fn run_full_pass_task(&self) {
        let mut ticker = interval(self.config.full_pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = self.run_pass(PassKind::Full).await;
        }
    }

    async fn run_battery_pass_task(&self) {
        let period = self.config.battery_pass_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = self.run_pass(PassKind::Battery).await;
        }
    }

    /// Runs one pass now, dispatches it and records the outcome
    pub async fn run_pass(&self, kind: PassKind) -> Result<PassReport> {
        let status = match kind {
            PassKind::Full => &self.full_status,
            PassKind::Battery => &self.battery_status,
        };
        let started = Utc::now();
        {
            let mut s = status.write().await;
            s.last_run = Some(started);
            s.run_count += 1;
        }

        let result = self.pass_and_dispatch(kind).await;

        let mut s = status.write().await;
        match &result {
            Ok(report) => {
                s.last_success = Some(started);
                s.success_count += 1;
                s.last_error = None;
                info!(%kind, warnings = report.warnings.len(), "pass dispatched");
            }
            Err(e) => {
                s.error_count += 1;
                s.last_error = Some(format!("{:#}", e));
                error!(%kind, error = %e, "pass failed, previous schedule stays in effect");
            }
        }
        result
    }

    async fn pass_and_dispatch(&self, kind: PassKind) -> Result<PassReport> {
        let now = Local::now().fixed_offset();
        let report = match kind {
            PassKind::Full => self.planner.run_full_pass(now).await?,
            PassKind::Battery => self.planner.run_battery_pass(now).await?,
        };
        self.dispatcher.dispatch(&report.schedule).await?;
        Ok(report)
    }

    pub async fn full_pass_status(&self) -> TaskStatus {
        self.full_status.read().await.clone()
    }

    pub async fn battery_pass_status(&self) -> TaskStatus {
        self.battery_status.read().await.clone()
    }
}
