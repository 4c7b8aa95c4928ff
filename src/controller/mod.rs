pub mod dispatch;
pub mod scheduler;
pub mod soc;

pub use dispatch::*;
pub use scheduler::*;
pub use soc::*;

use anyhow::Context;
use chrono::{DateTime, Duration, FixedOffset};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::config::Config;
use crate::domain::{
    battery_state_key, BatteryState, DeviceId, DeviceScheduleRequest, Horizon, PersistedDeviceState,
    Schedule, ScheduleDecision, SlotAction,
};
use crate::error::{PassWarning, SchedulingError};
use crate::forecast::{
    ForecastSource, HourlyProfileForecast, JsonFilePriceHistory, JsonFilePriceSource, NoForecast,
    PriceHistorySource, PriceSource,
};
use crate::optimizer::solver::default_backend;
use crate::optimizer::{
    BatteryEconomics, CandidateSets, CycleLimiter, HistoricalPercentiles, HorizonBuilder, LockManager,
    PriceThresholds, ScheduleAssembler, SolverBackend, ThermalOutcome, ThermalScheduler,
    ThresholdConfig, ThresholdSelector,
};
use crate::repo::{JsonFileStateStore, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PassKind {
    Full,
    Battery,
}

/// Values the planner needs from the configuration
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub slot_minutes: u32,
    pub horizon: Duration,
    pub solver_timeout: std::time::Duration,
    pub lock_window: Duration,
    pub default_gap: Duration,
    pub thresholds: ThresholdConfig,
    pub economics: BatteryEconomics,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PlannerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            slot_minutes: cfg.planner.slot_minutes,
            horizon: cfg.planner.horizon(),
            solver_timeout: cfg.planner.solver_timeout(),
            lock_window: Duration::hours(i64::from(cfg.planner.lock_hours)),
            default_gap: Duration::hours(i64::from(cfg.planner.default_gap_hours)),
            thresholds: cfg.thresholds.clone(),
            economics: cfg.battery.clone(),
        }
    }
}

/// A battery with its configured limits; `current_soc_pct` is the fallback reading
#[derive(Debug, Clone)]
pub struct BatteryDevice {
    pub device_id: DeviceId,
    pub battery: BatteryState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatterySummary {
    pub device_id: DeviceId,
    pub soc_pct: f64,
    pub final_soc_pct: f64,
    pub charged_kwh: f64,
    pub discharged_kwh: f64,
}

/// Result of one optimization pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub kind: PassKind,
    pub schedule: Schedule,
    pub thresholds: PriceThresholds,
    pub batteries: Vec<BatterySummary>,
    pub warnings: Vec<PassWarning>,
}

/// State the battery pass reuses from the last full pass
#[derive(Debug, Clone)]
struct PlanContext {
    horizon: Horizon,
    thresholds: PriceThresholds,
    candidates: CandidateSets,
    thermal: Vec<ScheduleDecision>,
}

/// Runs full and battery-only passes against the collaborators.
///
/// Passes are serialized: the context mutex is held for the whole pass, so the
/// two cadences never read or write persisted state concurrently.
pub struct Planner {
    settings: PlannerSettings,
    thermal: Vec<DeviceScheduleRequest>,
    batteries: Vec<BatteryDevice>,
    prices: Arc<dyn PriceSource>,
    history: Option<Arc<dyn PriceHistorySource>>,
    forecast: Arc<dyn ForecastSource>,
    soc: Arc<dyn SocSource>,
    store: Arc<dyn StateStore>,
    solver: Arc<dyn SolverBackend>,
    selector: ThresholdSelector,
    limiter: CycleLimiter,
    locks: LockManager,
    last_soc: SyncMutex<BTreeMap<DeviceId, f64>>,
    context: Mutex<Option<PlanContext>>,
}

impl Planner {
    pub fn new(settings: PlannerSettings, prices: Arc<dyn PriceSource>, store: Arc<dyn StateStore>) -> Self {
        Self {
            selector: ThresholdSelector::new(settings.thresholds.clone(), settings.economics.clone()),
            limiter: CycleLimiter::new(settings.economics.charge_buffer_fraction)
                .with_discharge_buffer(settings.economics.discharge_buffer_fraction),
            locks: LockManager::new(settings.default_gap, settings.lock_window),
            settings,
            thermal: Vec::new(),
            batteries: Vec::new(),
            prices,
            history: None,
            forecast: Arc::new(NoForecast),
            soc: Arc::new(StaticSocSource::new()),
            store,
            solver: Arc::from(default_backend()),
            last_soc: SyncMutex::new(BTreeMap::new()),
            context: Mutex::new(None),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn PriceHistorySource>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_forecast(mut self, forecast: Arc<dyn ForecastSource>) -> Self {
        self.forecast = forecast;
        self
    }

    pub fn with_soc_source(mut self, soc: Arc<dyn SocSource>) -> Self {
        self.soc = soc;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn SolverBackend>) -> Self {
        self.solver = solver;
        self
    }

    /// Adds a block-run device; its `blocks_required` is recomputed for the slot size
    pub fn with_thermal_device(mut self, mut request: DeviceScheduleRequest) -> Self {
        request.blocks_required = crate::domain::blocks_for(request.block_minutes, self.settings.slot_minutes);
        self.thermal.push(request);
        self
    }

    pub fn with_battery(mut self, device_id: impl Into<DeviceId>, battery: BatteryState) -> Self {
        self.batteries.push(BatteryDevice {
            device_id: device_id.into(),
            battery,
        });
        self
    }

    /// Wires the file-backed collaborators named in the configuration
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let settings = PlannerSettings::from_config(cfg);
        let prices = Arc::new(JsonFilePriceSource::new(
            &cfg.files.prices,
            std::time::Duration::from_secs(cfg.planner.price_cache_seconds),
        ));
        let store = Arc::new(JsonFileStateStore::new(&cfg.files.state));
        let mut planner = Planner::new(settings, prices, store);

        if let Some(path) = &cfg.files.history {
            planner = planner.with_history(Arc::new(JsonFilePriceHistory::new(path)));
        }
        if let Some(path) = &cfg.files.forecast {
            let body = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("forecast profile read failed: {}", path.display()))?;
            let load_kw: Vec<f64> = serde_json::from_str(&body).context("forecast profile parse failed")?;
            planner = planner.with_forecast(Arc::new(HourlyProfileForecast::new(load_kw)?));
        }
        if let Some(path) = &cfg.files.soc {
            planner = planner.with_soc_source(Arc::new(JsonFileSocSource::new(path)));
        }

        for (kind, device) in cfg.thermal_devices() {
            planner = planner.with_thermal_device(device.request(kind, cfg.planner.slot_minutes));
        }
        for device in cfg.batteries() {
            let battery = device.state(device.initial_soc_pct, cfg.battery.round_trip_efficiency);
            planner = planner.with_battery(device.id.clone(), battery);
        }
        info!(
            thermal = planner.thermal.len(),
            batteries = planner.batteries.len(),
            solver = planner.solver.name(),
            "planner configured"
        );
        Ok(planner)
    }

    /// Plans every device over a fresh horizon starting at the slot containing `now`
    pub async fn run_full_pass(&self, now: DateTime<FixedOffset>) -> Result<PassReport, SchedulingError> {
        let mut context = self.context.lock().await;
        self.full_pass(&mut context, now)
            .instrument(info_span!("pass", kind = %PassKind::Full))
            .await
    }

    /// Re-limits the batteries against fresh SOC readings, reusing the last full pass.
    /// Runs a full pass instead when there is none or its horizon has run out.
    pub async fn run_battery_pass(&self, now: DateTime<FixedOffset>) -> Result<PassReport, SchedulingError> {
        let mut context = self.context.lock().await;
        let reusable = context
            .as_ref()
            .filter(|ctx| ctx.horizon.end().is_some_and(|end| end > now))
            .cloned();
        match reusable {
            Some(ctx) => {
                self.battery_pass(ctx, now)
                    .instrument(info_span!("pass", kind = %PassKind::Battery))
                    .await
            }
            None => {
                info!("no current full pass, running one");
                self.full_pass(&mut context, now)
                    .instrument(info_span!("pass", kind = %PassKind::Full))
                    .await
            }
        }
    }

    async fn full_pass(
        &self,
        context: &mut Option<PlanContext>,
        now: DateTime<FixedOffset>,
    ) -> Result<PassReport, SchedulingError> {
        let (horizon, shortened) = self.fetch_horizon(now).await?;
        let mut warnings: Vec<PassWarning> = shortened.into_iter().collect();

        let mut keys: Vec<String> = self.thermal.iter().map(|r| r.device_id.clone()).collect();
        keys.extend(self.battery_keys());
        let states = self.read_states(&keys, &mut warnings).await;

        let history = self.historical_percentiles().await;
        let (thresholds, degraded) = self.selector.thresholds(history, &horizon);
        warnings.extend(degraded);
        let candidates = self.selector.candidates(&horizon, &thresholds);

        let lock_end = self.locks.lock_window_end(&horizon, now);
        let requests: Vec<DeviceScheduleRequest> = self
            .thermal
            .iter()
            .map(|template| {
                let state = state_of(&states, &template.device_id);
                template
                    .clone()
                    .with_locks(self.locks.locked_slot_indices(&state, &horizon, lock_end))
                    .with_initial_gap(self.locks.initial_gap_slots(&state, &horizon))
            })
            .collect();

        let mut thermal = Vec::with_capacity(requests.len());
        for outcome in self.schedule_thermal(requests, &horizon, now).await? {
            warnings.extend(outcome.warnings);
            thermal.push(outcome.decision);
        }

        let (battery, batteries) = self
            .limit_batteries(&horizon, &candidates, &states, lock_end, now, &mut warnings)
            .await;

        let mut decisions = thermal.clone();
        decisions.extend(battery.iter().cloned());
        let schedule = ScheduleAssembler::assemble(&decisions, &horizon, now);
        self.persist(&decisions, &states, &horizon, now).await?;

        info!(
            slots = horizon.len(),
            windows = schedule.windows().count(),
            warnings = warnings.len(),
            "full pass complete"
        );
        *context = Some(PlanContext {
            horizon,
            thresholds,
            candidates,
            thermal,
        });
        Ok(PassReport {
            kind: PassKind::Full,
            schedule,
            thresholds,
            batteries,
            warnings,
        })
    }

    async fn battery_pass(&self, ctx: PlanContext, now: DateTime<FixedOffset>) -> Result<PassReport, SchedulingError> {
        let mut warnings = Vec::new();
        let keys = self.battery_keys();
        let states = self.read_states(&keys, &mut warnings).await;

        let lock_end = self.locks.lock_window_end(&ctx.horizon, now);
        let (battery, batteries) = self
            .limit_batteries(&ctx.horizon, &ctx.candidates, &states, lock_end, now, &mut warnings)
            .await;

        let mut decisions = ctx.thermal.clone();
        decisions.extend(battery.iter().cloned());
        let schedule = ScheduleAssembler::assemble(&decisions, &ctx.horizon, now);
        self.persist(&battery, &states, &ctx.horizon, now).await?;

        info!(
            batteries = batteries.len(),
            warnings = warnings.len(),
            "battery pass complete"
        );
        Ok(PassReport {
            kind: PassKind::Battery,
            schedule,
            thresholds: ctx.thresholds,
            batteries,
            warnings,
        })
    }

    /// Horizon from the slot containing `now`, cut back to the last published price
    async fn fetch_horizon(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<(Horizon, Option<PassWarning>), SchedulingError> {
        let slot_minutes = self.settings.slot_minutes;
        let start = align_to_slot(now, slot_minutes)?;
        let end = start + self.settings.horizon;

        let points = self
            .prices
            .get_horizon(start, end, slot_minutes)
            .await
            .map_err(|e| SchedulingError::IncompleteHorizon(format!("price source failed: {:#}", e)))?;

        // Prices for the tail of the horizon may not be published yet
        let step = Duration::minutes(i64::from(slot_minutes));
        let available_end = points
            .iter()
            .map(|p| p.time_start + step)
            .max()
            .map_or(end, |last| last.min(end));
        let shortened = (available_end < end).then(|| {
            warn!(%available_end, %end, "horizon shortened to the published prices");
            PassWarning::HorizonShortened {
                available_end,
                requested_end: end,
            }
        });
        let horizon = HorizonBuilder::build(&points, start, available_end, slot_minutes)?;
        Ok((horizon, shortened))
    }

    async fn historical_percentiles(&self) -> Result<HistoricalPercentiles, SchedulingError> {
        let Some(history) = &self.history else {
            return Err(SchedulingError::DegradedHistory(
                "no price history source configured".into(),
            ));
        };
        let cfg = self.selector.config();
        let days = cfg.price_history_days;
        let lookup = async {
            let max_charge_price = history.percentile(days, cfg.charge_percentile).await?;
            let min_discharge_price = history.percentile(days, cfg.discharge_percentile).await?;
            anyhow::Ok(HistoricalPercentiles {
                max_charge_price,
                min_discharge_price,
            })
        };
        lookup
            .await
            .map_err(|e| SchedulingError::DegradedHistory(format!("{:#}", e)))
    }

    async fn read_states(
        &self,
        keys: &[String],
        warnings: &mut Vec<PassWarning>,
    ) -> BTreeMap<String, PersistedDeviceState> {
        let mut states = BTreeMap::new();
        for key in keys {
            let state = match self.store.get(key).await {
                Ok(mut state) => {
                    state.device_id = key.clone();
                    state
                }
                Err(e) => {
                    warn!(device = %key, error = %e, "state read failed, planning without locks");
                    warnings.push(PassWarning::StateReadFailed {
                        device_id: key.clone(),
                        reason: e.to_string(),
                    });
                    PersistedDeviceState::empty(key.clone())
                }
            };
            states.insert(key.clone(), state);
        }
        states
    }

    /// The solver may block up to its timeout, so thermal devices are planned off the runtime
    async fn schedule_thermal(
        &self,
        requests: Vec<DeviceScheduleRequest>,
        horizon: &Horizon,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<ThermalOutcome>, SchedulingError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let scheduler = ThermalScheduler::new(self.solver.clone(), self.settings.solver_timeout);
        let horizon = horizon.clone();
        tokio::task::spawn_blocking(move || {
            requests
                .iter()
                .map(|request| scheduler.schedule(request, &horizon, now))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SchedulingError::Solver(format!("thermal planning aborted: {}", e)))
    }

    async fn limit_batteries(
        &self,
        horizon: &Horizon,
        candidates: &CandidateSets,
        states: &BTreeMap<String, PersistedDeviceState>,
        lock_end: DateTime<FixedOffset>,
        now: DateTime<FixedOffset>,
        warnings: &mut Vec<PassWarning>,
    ) -> (Vec<ScheduleDecision>, Vec<BatterySummary>) {
        if self.batteries.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let usage = self.forecast.usage_for(horizon).await;

        let mut decisions = Vec::with_capacity(self.batteries.len() * 2);
        let mut summaries = Vec::with_capacity(self.batteries.len());
        for device in &self.batteries {
            let soc_pct = self.read_soc(device).await;
            let battery = device.battery.with_soc(soc_pct);
            let charge_state = state_of(states, &battery_state_key(&device.device_id, SlotAction::Charge));
            let discharge_state = state_of(states, &battery_state_key(&device.device_id, SlotAction::Discharge));
            let locks = self
                .locks
                .battery_locks(&charge_state, &discharge_state, horizon, lock_end);

            let plan = self
                .limiter
                .limit(&device.device_id, horizon, candidates, &battery, &locks, now, &usage);
            warnings.extend(plan.warnings);
            summaries.push(BatterySummary {
                device_id: device.device_id.clone(),
                soc_pct,
                final_soc_pct: plan.final_soc_pct,
                charged_kwh: plan.charged_kwh,
                discharged_kwh: plan.discharged_kwh,
            });
            decisions.push(plan.charge);
            decisions.push(plan.discharge);
        }
        (decisions, summaries)
    }

    /// Latest valid reading, else the last one seen, else the configured value
    async fn read_soc(&self, device: &BatteryDevice) -> f64 {
        let reading = match self.soc.current_soc_pct(&device.device_id).await {
            Ok(Some(pct)) if pct.is_finite() && (0.0..=100.0).contains(&pct) => Some(pct),
            Ok(Some(pct)) => {
                warn!(device = %device.device_id, soc_pct = pct, "SOC reading out of range, ignored");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(device = %device.device_id, error = %e, "SOC read failed");
                None
            }
        };
        let mut last = self.last_soc.lock();
        match reading {
            Some(pct) => {
                last.insert(device.device_id.clone(), pct);
                pct
            }
            None => last
                .get(&device.device_id)
                .copied()
                .unwrap_or(device.battery.current_soc_pct),
        }
    }

    /// Writes the next state of every decision in one store call
    async fn persist(
        &self,
        decisions: &[ScheduleDecision],
        states: &BTreeMap<String, PersistedDeviceState>,
        horizon: &Horizon,
        now: DateTime<FixedOffset>,
    ) -> Result<(), SchedulingError> {
        let next: Vec<PersistedDeviceState> = decisions
            .iter()
            .map(|decision| {
                let key = decision.state_key();
                let windows = ScheduleAssembler::windows(decision, horizon);
                self.locks
                    .next_state(&windows, &state_of(states, &key), horizon.slot_duration(), now)
            })
            .collect();
        if next.is_empty() {
            return Ok(());
        }
        self.store.save_all(&next).await.map_err(|e| {
            warn!(error = %e, "state write failed, the pass must be retried");
            e
        })
    }

    fn battery_keys(&self) -> Vec<String> {
        self.batteries
            .iter()
            .flat_map(|b| {
                [
                    battery_state_key(&b.device_id, SlotAction::Charge),
                    battery_state_key(&b.device_id, SlotAction::Discharge),
                ]
            })
            .collect()
    }
}

fn state_of(states: &BTreeMap<String, PersistedDeviceState>, key: &str) -> PersistedDeviceState {
    states
        .get(key)
        .cloned()
        .unwrap_or_else(|| PersistedDeviceState::empty(key))
}

/// Start of the slot containing `now`, on the UTC slot grid
pub fn align_to_slot(
    now: DateTime<FixedOffset>,
    slot_minutes: u32,
) -> Result<DateTime<FixedOffset>, SchedulingError> {
    if slot_minutes == 0 {
        return Err(SchedulingError::InvalidConfig("slot_minutes must be positive".into()));
    }
    let slot_secs = i64::from(slot_minutes) * 60;
    let secs = now.timestamp();
    let aligned = secs - secs.rem_euclid(slot_secs);
    DateTime::from_timestamp(aligned, 0)
        .map(|t| t.with_timezone(now.offset()))
        .ok_or_else(|| SchedulingError::IncompleteHorizon(format!("cannot align {} to the slot grid", now)))
}
