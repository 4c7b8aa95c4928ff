use chrono::{DateTime, FixedOffset};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::solver::{gaps_respect_minimum, SlotProblem, SolveOutcome, SolverBackend};
use crate::domain::{DeviceScheduleRequest, Horizon, ScheduleDecision};
use crate::error::{PassWarning, SchedulingError};

/// How a thermal decision was reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveMethod {
    Solver(&'static str),
    Heuristic,
}

impl fmt::Display for SolveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveMethod::Solver(name) => write!(f, "solver:{}", name),
            SolveMethod::Heuristic => write!(f, "greedy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThermalOutcome {
    pub decision: ScheduleDecision,
    pub method: SolveMethod,
    pub required: usize,
    /// Slots that could not be placed
    pub deficit: usize,
    pub warnings: Vec<PassWarning>,
}

impl ThermalOutcome {
    pub fn active(&self) -> BTreeSet<usize> {
        self.decision.active_slots()
    }

    /// The partial-schedule error, when the request was not fully met
    pub fn infeasibility(&self) -> Option<SchedulingError> {
        (self.deficit > 0).then(|| SchedulingError::InfeasibleSchedule {
            device_id: self.decision.device_id().to_string(),
            deficit: self.deficit,
        })
    }
}

/// Places the run slots of block-run devices (heat pump, hot water)
pub struct ThermalScheduler {
    solver: Arc<dyn SolverBackend>,
    timeout: Duration,
}

impl ThermalScheduler {
    pub fn new(solver: Arc<dyn SolverBackend>, timeout: Duration) -> Self {
        Self { solver, timeout }
    }

    pub fn schedule(
        &self,
        request: &DeviceScheduleRequest,
        horizon: &Horizon,
        now: DateTime<FixedOffset>,
    ) -> ThermalOutcome {
        let mut warnings = Vec::new();
        let problem = self.build_problem(request, horizon, now, &mut warnings);
        let required = problem.required;

        let (active, method) = match self.solve_exact(&problem, &request.device_id) {
            Some(active) => (active, SolveMethod::Solver(self.solver.name())),
            None => {
                if problem.max_gap_slots.is_some() {
                    debug!(device = %request.device_id, "greedy fallback ignores the max gap");
                }
                (greedy(&problem), SolveMethod::Heuristic)
            }
        };

        let deficit = required.saturating_sub(active.len());
        let decision = ScheduleDecision::Thermal {
            device_id: request.device_id.clone(),
            active,
        };
        let mut outcome = ThermalOutcome {
            decision,
            method,
            required,
            deficit,
            warnings,
        };
        if let Some(err) = outcome.infeasibility() {
            warn!(device = %request.device_id, deficit, "{}", err);
            outcome.warnings.extend(PassWarning::from_error(&err));
        }
        info!(
            device = %request.device_id,
            method = %outcome.method,
            slots = outcome.active().len(),
            required,
            "thermal schedule ready"
        );
        outcome
    }

    fn build_problem(
        &self,
        request: &DeviceScheduleRequest,
        horizon: &Horizon,
        now: DateTime<FixedOffset>,
        warnings: &mut Vec<PassWarning>,
    ) -> SlotProblem {
        let n = horizon.len();
        let frozen = horizon.first_future_index(now);
        let forced: BTreeSet<usize> = request
            .locked_slot_indices
            .iter()
            .copied()
            .filter(|&i| i < n)
            .collect();

        let allowed = horizon
            .slots()
            .iter()
            .map(|slot| {
                forced.contains(&slot.index)
                    || (slot.index >= frozen && request.allowed_window.permits(slot))
            })
            .collect();

        let mut required = request.blocks_required;
        if forced.len() > required {
            warn!(
                device = %request.device_id,
                locked = forced.len(),
                required,
                "locked slots exceed requirement"
            );
            warnings.push(PassWarning::LocksExceedRequirement {
                device_id: request.device_id.clone(),
                locked: forced.len(),
                required,
            });
            required = forced.len();
        }

        SlotProblem {
            costs: horizon.prices(),
            required,
            allowed,
            forced,
            min_gap_slots: request.min_gap_slots,
            max_gap_slots: request.max_gap_slots,
            initial_gap_slots: request.initial_gap_slots,
        }
    }

    /// Solver result, retried once without the carried-in history when that makes it infeasible
    fn solve_exact(&self, problem: &SlotProblem, device_id: &str) -> Option<BTreeSet<usize>> {
        match self.solver.solve(problem, self.timeout) {
            Ok(SolveOutcome::Optimal(active)) => return Some(active),
            Ok(SolveOutcome::TimedOut) => {
                warn!(device = %device_id, solver = self.solver.name(), "solver timed out, using greedy");
                return None;
            }
            Ok(SolveOutcome::Infeasible) => {}
            Err(e) => {
                warn!(device = %device_id, error = %e, "solver failed, using greedy");
                return None;
            }
        }

        if problem.initial_gap_slots.is_none() {
            return None;
        }
        debug!(device = %device_id, "infeasible with initial gap, retrying without it");
        let relaxed = SlotProblem {
            initial_gap_slots: None,
            ..problem.clone()
        };
        match self.solver.solve(&relaxed, self.timeout) {
            Ok(SolveOutcome::Optimal(active)) => Some(active),
            Ok(other) => {
                debug!(device = %device_id, ?other, "relaxed problem not solved");
                None
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "solver failed on relaxed problem");
                None
            }
        }
    }
}

/// Cheapest-first slot picking that skips slots breaking the minimum gap.
///
/// Starts from the forced slots. If the carried-in history keeps it short of
/// the requirement, it is retried without that history.
pub fn greedy(problem: &SlotProblem) -> BTreeSet<usize> {
    let strict = greedy_pass(problem, true);
    if strict.len() >= problem.required || problem.initial_gap_slots.is_none() {
        return strict;
    }
    let relaxed = greedy_pass(problem, false);
    if relaxed.len() > strict.len() {
        relaxed
    } else {
        strict
    }
}

fn greedy_pass(problem: &SlotProblem, respect_history: bool) -> BTreeSet<usize> {
    let mut active = problem.forced.clone();
    let candidates = (0..problem.len())
        .filter(|&i| problem.allowed[i] && !active.contains(&i))
        .sorted_by_key(|&i| (OrderedFloat(problem.costs[i]), i));

    for candidate in candidates {
        if active.len() >= problem.required {
            break;
        }
        active.insert(candidate);
        let first_ok = !respect_history
            || active.first().map_or(true, |&first| problem.may_start_at(first));
        if !first_ok || !gaps_respect_minimum(&active, problem.min_gap_slots) {
            active.remove(&candidate);
        }
    }
    active
}
