use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::domain::DeviceId;

/// Errors raised by the scheduling core and its storage boundary
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Incomplete horizon: {0}")]
    IncompleteHorizon(String),

    #[error("Infeasible schedule for {device_id}: {deficit} slot(s) could not be placed")]
    InfeasibleSchedule { device_id: DeviceId, deficit: usize },

    #[error("SOC constraint violated at slot {slot}: {soc_pct:.2}% outside [{min_pct}%, {max_pct}%]")]
    SocConstraintViolation {
        slot: usize,
        soc_pct: f64,
        min_pct: f64,
        max_pct: f64,
    },

    #[error("Price history unavailable: {0}")]
    DegradedHistory(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Solver error: {0}")]
    Solver(String),
}

impl From<std::io::Error> for SchedulingError {
    fn from(e: std::io::Error) -> Self {
        SchedulingError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulingError {
    fn from(e: serde_json::Error) -> Self {
        SchedulingError::Persistence(e.to_string())
    }
}

/// Non-fatal conditions surfaced by a pass. The pass still completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PassWarning {
    /// Historical percentiles were unavailable; in-horizon percentiles were used instead
    DegradedHistory { reason: String },
    /// A thermal device got fewer active slots than it asked for
    PartialSchedule { device_id: DeviceId, deficit: usize },
    /// Persisted state could not be read; the device was planned without locks
    StateReadFailed { device_id: DeviceId, reason: String },
    /// Committed battery actions already break the SOC window; nothing new was added
    LockedPlanInfeasible { device_id: DeviceId, reason: String },
    /// More slots are locked than the device requires; locks win
    LocksExceedRequirement { device_id: DeviceId, locked: usize, required: usize },
    /// Prices for the tail of the horizon are not published; planning stops at `available_end`
    HorizonShortened {
        available_end: DateTime<FixedOffset>,
        requested_end: DateTime<FixedOffset>,
    },
}

impl fmt::Display for PassWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassWarning::DegradedHistory { reason } => {
                write!(f, "degraded history, using horizon percentiles: {}", reason)
            }
            PassWarning::PartialSchedule { device_id, deficit } => {
                write!(f, "{}: partial schedule, {} slot(s) short", device_id, deficit)
            }
            PassWarning::StateReadFailed { device_id, reason } => {
                write!(f, "{}: state read failed ({}), planning without locks", device_id, reason)
            }
            PassWarning::LockedPlanInfeasible { device_id, reason } => {
                write!(f, "{}: locked battery plan infeasible: {}", device_id, reason)
            }
            PassWarning::LocksExceedRequirement { device_id, locked, required } => {
                write!(f, "{}: {} locked slots exceed the {} required", device_id, locked, required)
            }
            PassWarning::HorizonShortened { available_end, requested_end } => {
                write!(f, "horizon shortened to {} (requested {}), prices not published", available_end, requested_end)
            }
        }
    }
}

impl PassWarning {
    /// Maps the recoverable core errors onto the warning they degrade into
    pub fn from_error(e: &SchedulingError) -> Option<Self> {
        match e {
            SchedulingError::InfeasibleSchedule { device_id, deficit } => {
                Some(PassWarning::PartialSchedule {
                    device_id: device_id.clone(),
                    deficit: *deficit,
                })
            }
            SchedulingError::DegradedHistory(reason) => Some(PassWarning::DegradedHistory {
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}
