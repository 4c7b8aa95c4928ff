//! Property tests of the synchronous planning core

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone};
use proptest::prelude::*;

use price_scheduler::actions::{evaluate_expression, Variables};
use price_scheduler::domain::{BatteryState, DeviceKind, DeviceScheduleRequest, Horizon, PricePoint};
use price_scheduler::optimizer::solver::{gaps_respect_minimum, SlotProblem, SolveOutcome, SolverBackend};
use price_scheduler::optimizer::{
    BatteryEconomics, BatteryLocks, CycleLimiter, DynamicProgrammingSolver, HorizonBuilder, SocSimulator,
    ThermalScheduler, ThresholdConfig, ThresholdSelector,
};
use price_scheduler::SchedulingError;

fn t0() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(3600)
        .unwrap()
        .with_ymd_and_hms(2026, 3, 1, 0, 0, 0)
        .unwrap()
}

fn horizon(prices: &[f64]) -> Horizon {
    let points: Vec<PricePoint> = prices
        .iter()
        .enumerate()
        .map(|(i, &p)| PricePoint::new(t0() + chrono::Duration::minutes(15 * i as i64), p))
        .collect();
    HorizonBuilder::from_points(&points, 15).unwrap()
}

/// Cheapest cost over every subset the problem accepts, `None` when none does
fn brute_force_optimum(problem: &SlotProblem) -> Option<f64> {
    let n = problem.len();
    (0u32..1 << n)
        .map(|mask| (0..n).filter(|&i| mask & (1 << i) != 0).collect::<BTreeSet<usize>>())
        .filter(|active| problem.is_satisfied_by(active))
        .map(|active| active.iter().map(|&i| problem.costs[i]).sum::<f64>())
        .min_by(|a, b| a.total_cmp(b))
}

fn prices(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..0.6, len)
}

proptest! {
    #[test]
    fn thermal_meets_requirement_and_gap(
        prices in prices(8..40),
        blocks in 1usize..6,
        min_gap in 0usize..5,
    ) {
        let horizon = horizon(&prices);
        let request = DeviceScheduleRequest::new("heat_pump", DeviceKind::HeatPump, blocks as u32 * 15, 15, min_gap);
        let outcome = ThermalScheduler::new(Arc::new(DynamicProgrammingSolver), Duration::from_secs(5))
            .schedule(&request, &horizon, t0());

        // One contiguous run always fits, so the requirement is met exactly
        prop_assert_eq!(outcome.deficit, 0);
        prop_assert_eq!(outcome.active().len(), blocks);
        prop_assert!(gaps_respect_minimum(&outcome.active(), min_gap));
    }

    #[test]
    fn thermal_never_beats_brute_force_minimum(
        prices in prices(6..12),
        blocks in 1usize..4,
    ) {
        let horizon = horizon(&prices);
        let request = DeviceScheduleRequest::new("hot_water", DeviceKind::HotWater, blocks as u32 * 15, 15, 0);
        let outcome = ThermalScheduler::new(Arc::new(DynamicProgrammingSolver), Duration::from_secs(5))
            .schedule(&request, &horizon, t0());

        let mut sorted = prices.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let best: f64 = sorted.iter().take(blocks).sum();
        let got: f64 = outcome.active().iter().map(|&i| prices[i]).sum();
        prop_assert!((got - best).abs() < 1e-9);
    }

    #[test]
    fn dp_matches_brute_force_under_history_and_gaps(
        costs in prices(1..11),
        required in 0usize..5,
        min_gap in 0usize..4,
        max_gap in prop::option::of(0usize..5),
        initial_gap in prop::option::of(0usize..6),
    ) {
        let mut problem = SlotProblem::new(costs, required);
        problem.min_gap_slots = min_gap;
        problem.max_gap_slots = max_gap;
        problem.initial_gap_slots = initial_gap;

        let outcome = DynamicProgrammingSolver.solve(&problem, Duration::from_secs(5)).unwrap();
        match (outcome, brute_force_optimum(&problem)) {
            (SolveOutcome::Optimal(active), Some(best)) => {
                prop_assert!(problem.is_satisfied_by(&active));
                let got: f64 = active.iter().map(|&i| problem.costs[i]).sum();
                prop_assert!((got - best).abs() < 1e-9);
            }
            (SolveOutcome::Infeasible, None) => {}
            (outcome, best) => prop_assert!(false, "dp gave {:?}, brute force {:?}", outcome, best),
        }
    }

    #[test]
    fn battery_plan_stays_within_soc_window(
        prices in prices(8..64),
        soc in 20.0f64..90.0,
        rate_kw in 0.5f64..6.0,
        buffer in 0.0f64..0.5,
    ) {
        let horizon = horizon(&prices);
        let battery = BatteryState {
            capacity_kwh: 10.0,
            min_soc_pct: 20.0,
            max_soc_pct: 90.0,
            charge_rate_kw: rate_kw,
            current_soc_pct: soc,
            round_trip_efficiency: 0.9,
        };
        let selector = ThresholdSelector::new(ThresholdConfig::default(), BatteryEconomics::default());
        let (thresholds, _) = selector.thresholds(Err(SchedulingError::DegradedHistory("none".into())), &horizon);
        let candidates = selector.candidates(&horizon, &thresholds);

        let plan = CycleLimiter::new(buffer).limit(
            &"battery".to_string(),
            &horizon,
            &candidates,
            &battery,
            &BatteryLocks::default(),
            t0(),
            &[],
        );

        let charge: BTreeMap<usize, f64> = match &plan.charge {
            price_scheduler::domain::ScheduleDecision::Battery { flows, .. } => flows.clone(),
            _ => BTreeMap::new(),
        };
        let discharge: BTreeMap<usize, f64> = match &plan.discharge {
            price_scheduler::domain::ScheduleDecision::Battery { flows, .. } => {
                flows.iter().map(|(&i, &e)| (i, -e)).collect()
            }
            _ => BTreeMap::new(),
        };
        for kwh in SocSimulator::new(&battery, 0, horizon.len()).trace(&charge, &discharge) {
            prop_assert!(kwh >= battery.min_kwh() - 1e-6);
            prop_assert!(kwh <= battery.max_kwh() + 1e-6);
        }
        prop_assert!(plan.charged_kwh <= plan.discharged_kwh * (1.0 + buffer) + 1e-6);

        let charge_slots: BTreeSet<usize> = charge.keys().copied().collect();
        prop_assert!(charge_slots.is_subset(&candidates.charge.indices()));
        prop_assert!(charge.keys().all(|i| !discharge.contains_key(i)));
    }

    #[test]
    fn horizon_rejects_any_missing_slot(
        prices in prices(3..30),
        hole in any::<prop::sample::Index>(),
    ) {
        let mut points: Vec<PricePoint> = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| PricePoint::new(t0() + chrono::Duration::minutes(15 * i as i64), p))
            .collect();
        let end = t0() + chrono::Duration::minutes(15 * points.len() as i64);
        points.reverse();
        prop_assert_eq!(HorizonBuilder::build(&points, t0(), end, 15).unwrap().len(), prices.len());

        points.remove(hole.index(points.len()));
        let rebuilt = HorizonBuilder::build(&points, t0(), end, 15);
        prop_assert!(matches!(rebuilt, Err(SchedulingError::IncompleteHorizon(_))));
    }

    #[test]
    fn expression_arithmetic_matches_native(a in -1000i64..1000, b in 1i64..1000) {
        let mut vars = Variables::new();
        vars.insert("a".into(), a as f64);
        vars.insert("b".into(), b as f64);

        prop_assert_eq!(evaluate_expression("a + b * 2", &vars).unwrap(), (a + b * 2) as f64);
        prop_assert_eq!(evaluate_expression("a // b", &vars).unwrap(), a.div_euclid(b) as f64);
        prop_assert_eq!(evaluate_expression("a % b", &vars).unwrap(), a.rem_euclid(b) as f64);
        prop_assert_eq!(evaluate_expression("max(a, b, 0)", &vars).unwrap(), a.max(b).max(0) as f64);
    }
}
