//! Slot-assignment solvers
//!
//! A [`SlotProblem`] asks for exactly `required` active slots out of a horizon,
//! minimizing the summed slot cost, subject to:
//! - slots not `allowed` stay inactive, `forced` slots are active
//! - consecutive active slots form one run; two runs are separated by at least
//!   `min_gap_slots` inactive slots
//! - an idle stretch after a run never exceeds `max_gap_slots`
//! - the state before the horizon is described by `initial_gap_slots`: with
//!   `Some(g)` the carried idle count is `g` and a run starting at slot `j > 0`
//!   needs `g + j >= min_gap_slots`; `Some(0)` additionally lets slot 0 extend
//!   the previous run; `None` puts no bound on the first start or leading idle
//!
//! Among equal-cost assignments the one using the lowest slot indices wins.

pub mod dp;
pub mod milp;

pub use dp::DynamicProgrammingSolver;
pub use milp::MilpSolver;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::SchedulingError;

/// Tolerance used when comparing summed slot costs
pub const COST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct SlotProblem {
    pub costs: Vec<f64>,
    pub required: usize,
    pub allowed: Vec<bool>,
    pub forced: BTreeSet<usize>,
    pub min_gap_slots: usize,
    pub max_gap_slots: Option<usize>,
    /// `Some(0)`: the previous run ended at horizon start. `None`: no history.
    pub initial_gap_slots: Option<usize>,
}

impl SlotProblem {
    /// Unconstrained problem: every slot allowed, no gaps, no history
    pub fn new(costs: Vec<f64>, required: usize) -> Self {
        let n = costs.len();
        Self {
            costs,
            required,
            allowed: vec![true; n],
            forced: BTreeSet::new(),
            min_gap_slots: 0,
            max_gap_slots: None,
            initial_gap_slots: None,
        }
    }

    pub fn len(&self) -> usize {
        self.costs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }

    /// Whether the first active slot may be `first`, given the gap carried in from
    /// before the horizon
    pub fn may_start_at(&self, first: usize) -> bool {
        match self.initial_gap_slots {
            None => true,
            Some(0) => first == 0 || first >= self.min_gap_slots,
            Some(g) => g + first >= self.min_gap_slots,
        }
    }

    /// Checks an assignment against every rule of the problem
    pub fn is_satisfied_by(&self, active: &BTreeSet<usize>) -> bool {
        let n = self.len();
        if active.len() != self.required || active.iter().any(|&i| i >= n) {
            return false;
        }
        if active.iter().any(|&i| !self.allowed[i]) || !self.forced.is_subset(active) {
            return false;
        }
        if let Some(&first) = active.iter().next() {
            if !self.may_start_at(first) {
                return false;
            }
        }
        gaps_respect_minimum(active, self.min_gap_slots) && self.idle_stretches_ok(active)
    }

    fn idle_stretches_ok(&self, active: &BTreeSet<usize>) -> bool {
        let Some(max_gap) = self.max_gap_slots else {
            return true;
        };
        // Slot index just after the last active slot seen, with the idle count carried in
        let mut last_end: Option<(usize, usize)> = self.initial_gap_slots.map(|g| (0, g));
        for &i in active {
            if let Some((from, carried)) = last_end {
                if i > from && carried + (i - from) > max_gap {
                    return false;
                }
            }
            last_end = Some((i + 1, 0));
        }
        match last_end {
            Some((from, carried)) if from < self.len() => carried + (self.len() - from) <= max_gap,
            _ => true,
        }
    }
}

/// True when every idle stretch between two runs is at least `min_gap` slots long
pub fn gaps_respect_minimum(active: &BTreeSet<usize>, min_gap: usize) -> bool {
    active
        .iter()
        .zip(active.iter().skip(1))
        .all(|(&a, &b)| b == a + 1 || b - a - 1 >= min_gap)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    Optimal(BTreeSet<usize>),
    Infeasible,
    TimedOut,
}

/// Combinatorial backend behind the thermal scheduler
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must return within roughly `timeout`; `TimedOut` lets the caller fall back
    fn solve(&self, problem: &SlotProblem, timeout: Duration) -> Result<SolveOutcome, SchedulingError>;
}

/// Exact DP unless the `optimization` feature provides an LP backend
pub fn default_backend() -> Box<dyn SolverBackend> {
    #[cfg(feature = "optimization")]
    {
        Box::new(MilpSolver::default())
    }
    #[cfg(not(feature = "optimization"))]
    {
        Box::new(DynamicProgrammingSolver)
    }
}
