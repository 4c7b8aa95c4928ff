//! MILP backend
//!
//! One binary variable per slot. Formulation:
//! - `sum(x) == required`, disallowed slots fixed to 0, forced slots to 1
//! - a run ending at `i` blocks the next `min_gap_slots` slots:
//!   `x[i] - x[i+1] + x[j] <= 1`
//! - every window of `max_gap_slots + 1` slots following an active slot holds an
//!   active slot: `sum(x[a..=a+max]) >= x[a-1]`
//! - history before the horizon: after `initial_gap_slots = g > 0` the first
//!   `min_gap_slots - g` slots stay idle; with `g == 0` slots before
//!   `min_gap_slots` may only continue the run active at slot 0
//! - a tiny index-proportional cost makes the earliest assignment win ties

use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{SlotProblem, SolveOutcome, SolverBackend};
use crate::error::SchedulingError;

#[derive(Debug, Clone, Default)]
pub struct MilpSolver;

impl MilpSolver {
    #[cfg(feature = "optimization")]
    fn solve_lp(problem: &SlotProblem) -> Result<SolveOutcome, SchedulingError> {
        use good_lp::*;

        let n = problem.len();
        if problem.required > n {
            return Ok(SolveOutcome::Infeasible);
        }
        if n == 0 {
            return Ok(SolveOutcome::Optimal(Default::default()));
        }

        let scale = problem
            .costs
            .iter()
            .fold(1.0_f64, |acc, c| acc.max(c.abs()));
        let tie_break = 1e-6 * scale / (n * n) as f64;

        let mut vars = ProblemVariables::new();
        let x = vars.add_vector(variable().binary(), n);

        let objective: Expression = (0..n)
            .map(|i| (problem.costs[i] + tie_break * i as f64) * x[i])
            .sum();
        let mut model = vars.minimise(objective).using(default_solver);

        let total: Expression = x.iter().map(|v| Expression::from(*v)).sum();
        model = model.with(constraint!(total == problem.required as f64));

        for i in 0..n {
            if !problem.allowed[i] {
                model = model.with(constraint!(x[i] == 0.0));
            }
            if problem.forced.contains(&i) {
                model = model.with(constraint!(x[i] == 1.0));
            }
        }

        for i in 0..n.saturating_sub(1) {
            for j in (i + 2)..=(i + problem.min_gap_slots).min(n - 1) {
                model = model.with(constraint!(x[i] - x[i + 1] + x[j] <= 1.0));
            }
        }

        match problem.initial_gap_slots {
            Some(0) => {
                for j in 1..problem.min_gap_slots.min(n) {
                    model = model.with(constraint!(x[j] - x[j - 1] <= 0.0));
                }
            }
            Some(g) => {
                for j in 0..problem.min_gap_slots.saturating_sub(g).min(n) {
                    model = model.with(constraint!(x[j] == 0.0));
                }
            }
            None => {}
        }

        if let Some(max_gap) = problem.max_gap_slots {
            if let Some(g) = problem.initial_gap_slots {
                let upper = max_gap.saturating_sub(g);
                if upper < n {
                    let window: Expression = (0..=upper).map(|j| Expression::from(x[j])).sum();
                    model = model.with(constraint!(window >= 1.0));
                }
            }
            for a in 1..n {
                if a + max_gap >= n {
                    break;
                }
                let window: Expression = (a..=a + max_gap).map(|j| Expression::from(x[j])).sum();
                model = model.with(constraint!(window >= x[a - 1]));
            }
        }

        match model.solve() {
            Ok(solution) => Ok(SolveOutcome::Optimal(
                (0..n).filter(|&i| solution.value(x[i]) > 0.5).collect(),
            )),
            Err(ResolutionError::Infeasible) => Ok(SolveOutcome::Infeasible),
            Err(e) => Err(SchedulingError::Solver(e.to_string())),
        }
    }

    #[cfg(not(feature = "optimization"))]
    fn solve_lp(_problem: &SlotProblem) -> Result<SolveOutcome, SchedulingError> {
        Err(SchedulingError::Solver(
            "MILP backend requires the 'optimization' feature".into(),
        ))
    }
}

impl SolverBackend for MilpSolver {
    fn name(&self) -> &'static str {
        "milp"
    }

    fn solve(&self, problem: &SlotProblem, timeout: Duration) -> Result<SolveOutcome, SchedulingError> {
        // The LP solver has no portable time limit; a detached worker keeps the caller bounded
        let (tx, rx) = mpsc::channel();
        let owned = problem.clone();
        std::thread::spawn(move || {
            let _ = tx.send(Self::solve_lp(&owned));
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => {
                debug!(?result, "milp solve finished");
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "milp solver timed out");
                Ok(SolveOutcome::TimedOut)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SchedulingError::Solver("milp worker exited without a result".into()))
            }
        }
    }
}
