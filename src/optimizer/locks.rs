use chrono::{DateTime, Duration, FixedOffset};
use std::collections::BTreeSet;
use tracing::debug;

use super::cycle_limiter::BatteryLocks;
use crate::domain::{ActionWindow, Horizon, PersistedDeviceState};

/// Turns persisted device state into hard constraints for the next pass
#[derive(Debug, Clone)]
pub struct LockManager {
    /// Assumed time since the last run when none is recorded
    default_gap: Duration,
    /// Committed actions closer than this to the pass start are locked
    lock_window: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self {
            default_gap: Duration::hours(4),
            lock_window: Duration::hours(2),
        }
    }
}

impl LockManager {
    pub fn new(default_gap: Duration, lock_window: Duration) -> Self {
        Self {
            default_gap,
            lock_window,
        }
    }

    /// Whole slots between the end of the last run and the horizon start.
    /// Zero while a run is still in progress at horizon start.
    ///
    /// Persisted starts before the horizon are runs that already happened; a
    /// recorded end after the horizon start is ignored.
    pub fn initial_gap_slots(&self, state: &PersistedDeviceState, horizon: &Horizon) -> usize {
        let slot_minutes = i64::from(horizon.slot_minutes().max(1));
        let Some(start) = horizon.start() else {
            return 0;
        };
        let executed_end = state
            .locked_starts
            .iter()
            .filter(|&&t| t < start)
            .max()
            .map(|&t| t + horizon.slot_duration());
        let recorded_end = state.last_run_end.filter(|&end| end <= start);
        match executed_end.max(recorded_end) {
            None => {
                let slots = (self.default_gap.num_minutes() / slot_minutes).max(0) as usize;
                debug!(device = %state.device_id, slots, "no previous run recorded, using default gap");
                slots
            }
            Some(end) if end >= start => 0,
            Some(end) => ((start - end).num_minutes() / slot_minutes) as usize,
        }
    }

    /// End of the lock window for a pass running at `now`
    pub fn lock_window_end(&self, horizon: &Horizon, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let anchor = horizon.start().map_or(now, |start| start.max(now));
        anchor + self.lock_window
    }

    /// Slot indices of persisted starts inside `[horizon_start, lock_end)`
    pub fn locked_slot_indices(
        &self,
        state: &PersistedDeviceState,
        horizon: &Horizon,
        lock_end: DateTime<FixedOffset>,
    ) -> BTreeSet<usize> {
        let Some(start) = horizon.start() else {
            return BTreeSet::new();
        };
        let locked: BTreeSet<usize> = state
            .locked_starts
            .iter()
            .filter(|&&t| t >= start && t < lock_end)
            .filter_map(|&t| horizon.index_of(t))
            .collect();
        if !locked.is_empty() {
            debug!(device = %state.device_id, slots = ?locked, "locked slots");
        }
        locked
    }

    pub fn battery_locks(
        &self,
        charge: &PersistedDeviceState,
        discharge: &PersistedDeviceState,
        horizon: &Horizon,
        lock_end: DateTime<FixedOffset>,
    ) -> BatteryLocks {
        BatteryLocks {
            charge: self.locked_slot_indices(charge, horizon, lock_end),
            discharge: self.locked_slot_indices(discharge, horizon, lock_end),
        }
    }

    /// State to persist after a pass at `now` that produced `windows` for this key.
    ///
    /// Every active slot start is recorded; the lock window decides on the next
    /// read which of them are binding. `last_run_end` only ever moves to a run
    /// end that is not after `now`.
    pub fn next_state(
        &self,
        windows: &[ActionWindow],
        previous: &PersistedDeviceState,
        slot: Duration,
        now: DateTime<FixedOffset>,
    ) -> PersistedDeviceState {
        let mut locked_starts = Vec::new();
        for window in windows {
            let mut t = window.start;
            loop {
                locked_starts.push(t);
                t += slot;
                if slot <= Duration::zero() || t >= window.end {
                    break;
                }
            }
        }

        let known: BTreeSet<DateTime<FixedOffset>> = previous
            .locked_starts
            .iter()
            .copied()
            .filter(|&t| t < now)
            .chain(locked_starts.iter().copied())
            .collect();
        let finished = known
            .iter()
            .map(|&t| t + slot)
            .filter(|end| *end <= now && !known.contains(end))
            .max();
        let last_run_end = finished.max(previous.last_run_end.filter(|&end| end <= now));

        PersistedDeviceState {
            device_id: previous.device_id.clone(),
            last_run_end,
            locked_starts,
        }
    }
}
