use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use super::{SlotProblem, SolveOutcome, SolverBackend, COST_EPSILON};
use crate::error::SchedulingError;

/// Exact solver over `(slot, remaining, run state)`.
///
/// Works backwards from the end of the horizon computing the cheapest completion
/// for every state, then walks forward preferring activation whenever it stays
/// optimal, which yields the earliest-indexed assignment among equal-cost ones.
pub struct DynamicProgrammingSolver;

/// Run state before a slot. Idle counts saturate at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    /// No run yet and no history
    Fresh,
    /// Previous slot was active
    Active,
    /// Idle for this many slots since the last run ended
    Idle(usize),
}

struct StateSpace {
    cap: usize,
    min_gap: usize,
    max_gap: Option<usize>,
}

impl StateSpace {
    fn new(problem: &SlotProblem) -> Self {
        let cap = problem.min_gap_slots.max(problem.max_gap_slots.unwrap_or(0)) + 1;
        Self {
            cap,
            min_gap: problem.min_gap_slots,
            max_gap: problem.max_gap_slots,
        }
    }

    fn size(&self) -> usize {
        self.cap + 2
    }

    fn encode(&self, state: RunState) -> usize {
        match state {
            RunState::Fresh => 0,
            RunState::Active => 1,
            RunState::Idle(g) => 1 + g.clamp(1, self.cap),
        }
    }

    fn decode(&self, code: usize) -> RunState {
        match code {
            0 => RunState::Fresh,
            1 => RunState::Active,
            c => RunState::Idle(c - 1),
        }
    }

    fn initial(&self, initial_gap: Option<usize>) -> RunState {
        match initial_gap {
            None => RunState::Fresh,
            Some(0) => RunState::Active,
            Some(g) => RunState::Idle(g.min(self.cap)),
        }
    }

    fn can_activate(&self, state: RunState) -> bool {
        match state {
            RunState::Fresh | RunState::Active => true,
            RunState::Idle(g) => g >= self.min_gap,
        }
    }

    /// State after leaving a slot idle, or `None` when the idle stretch grows too long
    fn idle_from(&self, state: RunState) -> Option<RunState> {
        let next = match state {
            RunState::Fresh => return Some(RunState::Fresh),
            RunState::Active => RunState::Idle(1),
            RunState::Idle(g) => RunState::Idle((g + 1).min(self.cap)),
        };
        match (next, self.max_gap) {
            (RunState::Idle(g), Some(max)) if g > max => None,
            _ => Some(next),
        }
    }
}

impl DynamicProgrammingSolver {
    fn run(&self, problem: &SlotProblem, deadline: Instant) -> SolveOutcome {
        let n = problem.len();
        let k_max = problem.required;
        if k_max > n {
            return SolveOutcome::Infeasible;
        }

        let space = StateSpace::new(problem);
        let s_count = space.size();
        let idx = |i: usize, k: usize, s: usize| (i * (k_max + 1) + k) * s_count + s;

        let mut value = vec![f64::INFINITY; (n + 1) * (k_max + 1) * s_count];
        for s in 0..s_count {
            value[idx(n, 0, s)] = 0.0;
        }

        for i in (0..n).rev() {
            if Instant::now() >= deadline {
                return SolveOutcome::TimedOut;
            }
            let forced = problem.forced.contains(&i);
            let allowed = problem.allowed[i];
            for k in 0..=k_max {
                for s in 0..s_count {
                    let state = space.decode(s);
                    let mut best = f64::INFINITY;
                    if k > 0 && allowed && space.can_activate(state) {
                        let next = value[idx(i + 1, k - 1, space.encode(RunState::Active))];
                        best = best.min(problem.costs[i] + next);
                    }
                    if !forced {
                        if let Some(next_state) = space.idle_from(state) {
                            best = best.min(value[idx(i + 1, k, space.encode(next_state))]);
                        }
                    }
                    value[idx(i, k, s)] = best;
                }
            }
        }

        let mut state = space.initial(problem.initial_gap_slots);
        let optimum = value[idx(0, k_max, space.encode(state))];
        if !optimum.is_finite() {
            return SolveOutcome::Infeasible;
        }

        let mut active = BTreeSet::new();
        let mut k = k_max;
        let mut spent = 0.0;
        for i in 0..n {
            let current = value[idx(i, k, space.encode(state))];
            let activate = if k > 0 && problem.allowed[i] && space.can_activate(state) {
                let cost = problem.costs[i] + value[idx(i + 1, k - 1, space.encode(RunState::Active))];
                cost <= current + COST_EPSILON * (1.0 + current.abs())
            } else {
                false
            };
            if activate {
                active.insert(i);
                spent += problem.costs[i];
                k -= 1;
                state = RunState::Active;
            } else {
                match space.idle_from(state) {
                    Some(next) => state = next,
                    None => return SolveOutcome::Infeasible,
                }
            }
        }

        debug!(cost = spent, optimum, slots = active.len(), "dp reconstruction done");
        SolveOutcome::Optimal(active)
    }
}

impl SolverBackend for DynamicProgrammingSolver {
    fn name(&self) -> &'static str {
        "dp"
    }

    #[instrument(skip_all, fields(slots = problem.len(), required = problem.required))]
    fn solve(&self, problem: &SlotProblem, timeout: Duration) -> Result<SolveOutcome, SchedulingError> {
        if problem.allowed.len() != problem.len() {
            return Err(SchedulingError::Solver(format!(
                "allowed mask has {} entries for {} slots",
                problem.allowed.len(),
                problem.len()
            )));
        }
        if problem.forced.iter().any(|&i| i >= problem.len()) {
            return Ok(SolveOutcome::Infeasible);
        }

        let start = Instant::now();
        let outcome = self.run(problem, start + timeout);
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, ?outcome, "dp solve finished");
        Ok(outcome)
    }
}
