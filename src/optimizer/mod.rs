pub mod assembler;
pub mod constraints;
pub mod cycle_limiter;
pub mod horizon;
pub mod locks;
pub mod solver;
pub mod thermal;
pub mod thresholds;

pub use assembler::*;
pub use constraints::*;
pub use cycle_limiter::*;
pub use horizon::*;
pub use locks::*;
pub use solver::{DynamicProgrammingSolver, MilpSolver, SlotProblem, SolveOutcome, SolverBackend};
pub use thermal::*;
pub use thresholds::*;
