//! Price-driven scheduling of thermal loads and home batteries.
//!
//! The `optimizer` core is synchronous and works on already fetched inputs.
//! `controller` fetches those inputs through the `forecast` and `repo`
//! collaborators, runs the core and hands the result to a dispatcher.

pub mod actions;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod optimizer;
pub mod repo;
pub mod telemetry;

pub use error::{PassWarning, SchedulingError};
