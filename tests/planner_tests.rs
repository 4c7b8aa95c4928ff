//! End-to-end planning scenarios against the public API

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone};
use mockall::mock;
use rstest::rstest;

use price_scheduler::controller::{Dispatcher, LogDispatcher, PassKind, Planner, PlannerSettings, StaticSocSource};
use price_scheduler::domain::{
    BatteryState, DeviceKind, DeviceScheduleRequest, PersistedDeviceState, PricePoint, Schedule, SlotAction,
};
use price_scheduler::forecast::{StaticPriceHistory, StaticPriceSource};
use price_scheduler::optimizer::solver::default_backend;
use price_scheduler::optimizer::{
    BatteryEconomics, BatteryLocks, CandidateSets, CandidateSlot, CandidateSlotSet, CycleLimiter,
    DynamicProgrammingSolver, HorizonBuilder, SolverBackend, ThermalScheduler, ThresholdConfig,
    ThresholdSelector, ThresholdSource,
};
use price_scheduler::repo::{InMemoryStateStore, JsonFileStateStore, StateStore};
use price_scheduler::{PassWarning, SchedulingError};

mock! {
    pub Store {}

    #[async_trait]
    impl StateStore for Store {
        async fn get(&self, device_id: &str) -> Result<PersistedDeviceState, SchedulingError>;
        async fn save(&self, device_id: &str, state: &PersistedDeviceState) -> Result<(), SchedulingError>;
        async fn save_all(&self, states: &[PersistedDeviceState]) -> Result<(), SchedulingError>;
    }
}

fn t0() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(7200)
        .unwrap()
        .with_ymd_and_hms(2026, 10, 18, 0, 0, 0)
        .unwrap()
}

fn points(prices: &[f64], slot_minutes: i64) -> Vec<PricePoint> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| PricePoint::new(t0() + chrono::Duration::minutes(slot_minutes * i as i64), p))
        .collect()
}

/// A day of quarter-hour prices with a cheap night and an expensive evening
fn day_prices() -> Vec<PricePoint> {
    let prices: Vec<f64> = (0..96)
        .map(|i| {
            let hour = i as f64 / 4.0;
            0.12 + 0.18 * (-(hour - 18.5).powi(2) / 8.0).exp() + 0.06 * (-(hour - 7.5).powi(2) / 3.0).exp()
                - 0.04 * (-(hour - 3.0).powi(2) / 4.0).exp()
                + (i % 3) as f64 * 0.001
        })
        .collect();
    points(&prices, 15)
}

fn household(store: Arc<dyn StateStore>) -> Planner {
    Planner::new(PlannerSettings::default(), Arc::new(StaticPriceSource::new(day_prices())), store)
        .with_thermal_device(DeviceScheduleRequest::new("heat_pump", DeviceKind::HeatPump, 180, 15, 8))
        .with_thermal_device(DeviceScheduleRequest::new("hot_water", DeviceKind::HotWater, 60, 15, 16))
        .with_battery("battery", BatteryState::default())
        .with_soc_source(Arc::new(StaticSocSource::new().with_reading("battery", 55.0)))
}

/// Every active slot start of one device action
fn active_starts(schedule: &Schedule, device_id: &str, action: SlotAction) -> BTreeSet<DateTime<FixedOffset>> {
    let step = chrono::Duration::minutes(15);
    schedule
        .timeline(device_id)
        .map(|timeline| {
            timeline
                .windows
                .iter()
                .filter(|w| w.action == action)
                .flat_map(|w| (0..w.slots.len() as i32).map(move |k| w.start + step * k))
                .collect()
        })
        .unwrap_or_default()
}

#[rstest]
#[case::dp_no_gap(Arc::new(DynamicProgrammingSolver), 0, [0, 3])]
#[case::default_no_gap(Arc::from(default_backend()), 0, [0, 3])]
#[case::dp_gap_two(Arc::new(DynamicProgrammingSolver), 2, [0, 3])]
#[case::dp_gap_three(Arc::new(DynamicProgrammingSolver), 3, [2, 3])]
#[case::default_gap_three(Arc::from(default_backend()), 3, [2, 3])]
fn test_thermal_picks_cheapest_feasible_slots(
    #[case] solver: Arc<dyn SolverBackend>,
    #[case] min_gap: usize,
    #[case] expected: [usize; 2],
) {
    let horizon = HorizonBuilder::from_points(&points(&[0.10, 0.20, 0.15, 0.05, 0.30], 15), 15).unwrap();
    let request = DeviceScheduleRequest::new("heat_pump", DeviceKind::HeatPump, 30, 15, min_gap);

    let outcome = ThermalScheduler::new(solver, Duration::from_secs(2)).schedule(&request, &horizon, t0());

    assert_eq!(outcome.active(), BTreeSet::from(expected));
    assert_eq!(outcome.deficit, 0);
    assert!(outcome.warnings.is_empty());
}

#[rstest]
#[case::reaches_min_soc(3.0, true, 20.0)]
#[case::would_break_min_soc(3.5, false, 50.0)]
fn test_discharge_respects_min_soc(#[case] rate_kw: f64, #[case] accepted: bool, #[case] final_soc: f64) {
    let horizon = HorizonBuilder::from_points(&points(&[0.40, 0.10, 0.10, 0.10], 60), 60).unwrap();
    let battery = BatteryState {
        capacity_kwh: 10.0,
        min_soc_pct: 20.0,
        max_soc_pct: 90.0,
        charge_rate_kw: rate_kw,
        current_soc_pct: 50.0,
        ..BatteryState::default()
    };
    let candidates = CandidateSets {
        charge: CandidateSlotSet::empty(SlotAction::Charge),
        discharge: CandidateSlotSet {
            action: SlotAction::Discharge,
            slots: vec![CandidateSlot { index: 0, price: 0.40 }],
        },
    };

    let plan = CycleLimiter::new(0.2).limit(
        &"battery".to_string(),
        &horizon,
        &candidates,
        &battery,
        &BatteryLocks::default(),
        t0(),
        &[],
    );

    assert_eq!(plan.discharge.is_active(0), accepted);
    assert!(plan.charge.active_slots().is_empty());
    assert!((plan.final_soc_pct - final_soc).abs() < 1e-6);
    if accepted {
        assert_eq!(plan.discharge.flow(0), Some(-rate_kw));
    }
}

#[test]
fn test_charge_candidates_retained_by_time_percentage() {
    // A permutation of 48 distinct prices
    let prices: Vec<f64> = (0..48).map(|i| 0.10 + ((i * 17) % 48) as f64 * 0.01).collect();
    let horizon = HorizonBuilder::from_points(&points(&prices, 15), 15).unwrap();
    let selector = ThresholdSelector::new(ThresholdConfig::default(), BatteryEconomics::default());

    let (thresholds, warning) =
        selector.thresholds(Err(SchedulingError::DegradedHistory("none".into())), &horizon);
    let sets = selector.candidates(&horizon, &thresholds);

    assert!(warning.is_some());
    assert_eq!(sets.charge.len(), 12);
    assert_eq!(sets.discharge.len(), 12);
    let mut charge_prices: Vec<f64> = sets.charge.slots.iter().map(|s| s.price).collect();
    charge_prices.sort_by(|a, b| a.total_cmp(b));
    let cheapest: Vec<f64> = (0..12).map(|k| 0.10 + k as f64 * 0.01).collect();
    for (got, want) in charge_prices.iter().zip(&cheapest) {
        assert!((got - want).abs() < 1e-9);
    }
    assert!(sets.charge.slots.iter().all(|s| s.price <= thresholds.max_charge_price));
    assert!(sets.charge.indices().is_disjoint(&sets.discharge.indices()));
}

#[rstest]
#[case::unavailable(StaticPriceHistory::unavailable(), ThresholdSource::Horizon, true)]
#[case::too_short(StaticPriceHistory::new(vec![0.2; 10]), ThresholdSource::Horizon, true)]
#[case::recorded(StaticPriceHistory::new((0..200).map(|i| 0.05 + i as f64 * 0.002).collect()), ThresholdSource::History, false)]
#[tokio::test]
async fn test_history_fallback(
    #[case] history: StaticPriceHistory,
    #[case] source: ThresholdSource,
    #[case] degraded: bool,
) {
    let planner = household(Arc::new(InMemoryStateStore::new())).with_history(Arc::new(history));

    let report = planner.run_full_pass(t0()).await.unwrap();

    assert_eq!(report.thresholds.source, source);
    let warned = report
        .warnings
        .iter()
        .any(|w| matches!(w, PassWarning::DegradedHistory { .. }));
    assert_eq!(warned, degraded);
    assert!(report.schedule.timeline("heat_pump").is_some());
}

#[tokio::test]
async fn test_identical_inputs_give_identical_schedules() {
    let first = household(Arc::new(InMemoryStateStore::new()))
        .run_full_pass(t0())
        .await
        .unwrap();
    let second = household(Arc::new(InMemoryStateStore::new()))
        .run_full_pass(t0())
        .await
        .unwrap();

    assert_ne!(first.schedule.id, second.schedule.id);
    assert_eq!(first.schedule.timelines, second.schedule.timelines);
    assert_eq!(first.schedule.valid_from, second.schedule.valid_from);
    assert_eq!(first.schedule.valid_until, second.schedule.valid_until);
    assert_eq!(first.warnings, second.warnings);
}

#[tokio::test]
async fn test_locked_slots_survive_replanning() {
    let store = Arc::new(InMemoryStateStore::new());
    let planner = household(store.clone());
    let first = planner.run_full_pass(t0()).await.unwrap();

    // The second horizon starts one slot later
    let later = t0() + chrono::Duration::minutes(20);
    let second = planner.run_full_pass(later).await.unwrap();

    let lock_end = t0() + chrono::Duration::hours(2);
    let replan_start = second.schedule.valid_from;
    for (device, action) in [
        ("heat_pump", SlotAction::Run),
        ("hot_water", SlotAction::Run),
        ("battery", SlotAction::Charge),
        ("battery", SlotAction::Discharge),
    ] {
        let committed: BTreeSet<_> = active_starts(&first.schedule, device, action)
            .into_iter()
            .filter(|&t| t >= replan_start && t < lock_end)
            .collect();
        let replanned = active_starts(&second.schedule, device, action);
        assert!(
            committed.is_subset(&replanned),
            "{} {} lost locked slots: {:?} vs {:?}",
            device,
            action,
            committed,
            replanned
        );
    }
}

#[tokio::test]
async fn test_replanning_keeps_the_cheap_run_outside_the_lock_window() {
    let prices: Vec<f64> = (0..96).map(|i| if (10..14).contains(&i) { 0.05 } else { 0.30 }).collect();
    let store = Arc::new(InMemoryStateStore::new());
    let planner = Planner::new(
        PlannerSettings::default(),
        Arc::new(StaticPriceSource::new(points(&prices, 15))),
        store.clone(),
    )
    .with_thermal_device(DeviceScheduleRequest::new("heat_pump", DeviceKind::HeatPump, 60, 15, 16));

    let cheap: BTreeSet<_> = (10..14)
        .map(|i| t0() + chrono::Duration::minutes(15 * i))
        .collect();
    let first = planner.run_full_pass(t0()).await.unwrap();
    assert_eq!(active_starts(&first.schedule, "heat_pump", SlotAction::Run), cheap);

    // Nothing has run yet, so the planned run is no reason to wait
    let state = store.get("heat_pump").await.unwrap();
    assert_eq!(state.last_run_end, None);

    let second = planner
        .run_full_pass(t0() + chrono::Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(active_starts(&second.schedule, "heat_pump", SlotAction::Run), cheap);
}

#[tokio::test]
async fn test_unchanged_state_gives_identical_locked_plan() {
    let seed = Arc::new(InMemoryStateStore::new());
    household(seed.clone()).run_full_pass(t0()).await.unwrap();
    let states: Vec<PersistedDeviceState> = seed.snapshot().into_values().collect();

    let later = t0() + chrono::Duration::minutes(20);
    let mut reports = Vec::new();
    for _ in 0..2 {
        let store = Arc::new(InMemoryStateStore::new());
        store.save_all(&states).await.unwrap();
        reports.push(household(store).run_full_pass(later).await.unwrap());
    }

    assert_eq!(reports[0].schedule.timelines, reports[1].schedule.timelines);
}

#[tokio::test]
async fn test_failed_write_is_retried_by_next_pass() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut store = MockStore::new();
    store
        .expect_get()
        .returning(|id| Ok(PersistedDeviceState::empty(id)));
    let counter = attempts.clone();
    store.expect_save_all().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(SchedulingError::Persistence("disk full".into()))
        } else {
            Ok(())
        }
    });
    let planner = household(Arc::new(store));

    let err = planner.run_full_pass(t0()).await.unwrap_err();
    assert!(matches!(err, SchedulingError::Persistence(ref m) if m == "disk full"));

    // No full pass was committed, so the battery trigger re-plans everything
    let report = planner.run_battery_pass(t0()).await.unwrap();
    assert_eq!(report.kind, PassKind::Full);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreadable_state_plans_without_locks() {
    let mut store = MockStore::new();
    store
        .expect_get()
        .returning(|_| Err(SchedulingError::Persistence("permission denied".into())));
    store.expect_save_all().times(1).returning(|_| Ok(()));
    let planner = household(Arc::new(store));

    let report = planner.run_full_pass(t0()).await.unwrap();

    let unreadable: BTreeSet<&str> = report
        .warnings
        .iter()
        .filter_map(|w| match w {
            PassWarning::StateReadFailed { device_id, .. } => Some(device_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        unreadable,
        BTreeSet::from(["battery_charge", "battery_discharge", "heat_pump", "hot_water"])
    );
    assert!(report.schedule.timeline("hot_water").is_some());
}

#[tokio::test]
async fn test_json_state_file_round_trip() {
    let path = std::env::temp_dir().join(format!("planner-state-{}.json", uuid::Uuid::new_v4()));
    let planner = household(Arc::new(JsonFileStateStore::new(&path)));

    let report = planner.run_full_pass(t0()).await.unwrap();

    let body = tokio::fs::read_to_string(&path).await.unwrap();
    let file: BTreeMap<String, serde_json::Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(
        file.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["battery_charge", "battery_discharge", "heat_pump", "hot_water"]
    );
    let heat_pump = &file["heat_pump"];
    let starts = heat_pump["locked_starts"].as_array().unwrap();
    assert_eq!(starts.len(), 12);
    assert_eq!(
        active_starts(&report.schedule, "heat_pump", SlotAction::Run).len(),
        starts.len()
    );
    // Planned runs are not history until they have ended
    assert!(heat_pump["last_run_end"].is_null());

    let noon = t0() + chrono::Duration::hours(12);
    planner.run_full_pass(noon).await.unwrap();
    let body = tokio::fs::read_to_string(&path).await.unwrap();
    let file: BTreeMap<String, serde_json::Value> = serde_json::from_str(&body).unwrap();
    let last_run_end = file["heat_pump"]["last_run_end"].as_str().unwrap();
    assert!(DateTime::parse_from_rfc3339(last_run_end).unwrap() <= noon);

    tokio::fs::remove_file(&path).await.unwrap();
}

#[tokio::test]
async fn test_dispatch_of_a_planned_schedule() {
    let planner = household(Arc::new(InMemoryStateStore::new()));
    let report = planner.run_full_pass(t0()).await.unwrap();

    let dispatcher = LogDispatcher::new();
    let commands = dispatcher.commands(&report.schedule);
    assert_eq!(commands.len(), report.schedule.windows().count());
    assert!(commands.iter().all(|c| c.start.is_empty() && c.stop.is_empty()));
    dispatcher.dispatch(&report.schedule).await.unwrap();
}
