//! Battery cycle limiting
//!
//! Refines the threshold candidates into a plan that keeps the simulated SOC
//! inside the battery window and does not charge much more than it discharges.
//!
//! Phase 1 adds discharge candidates, most expensive first. Phase 2 adds charge
//! candidates, cheapest first; every accepted charge triggers one re-check of the
//! discharge slots rejected so far.

use chrono::{DateTime, FixedOffset};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

use super::thresholds::CandidateSets;
use crate::domain::{BatteryState, DeviceId, Horizon, ScheduleDecision, SlotAction};
use crate::error::{PassWarning, SchedulingError};

/// Energy tolerance in kWh; keeps exact boundary values feasible
pub const SOC_TOLERANCE_KWH: f64 = 1e-9;

/// Slots committed by earlier passes, per action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatteryLocks {
    pub charge: BTreeSet<usize>,
    pub discharge: BTreeSet<usize>,
}

/// Limited battery plan
#[derive(Debug, Clone)]
pub struct BatteryPlan {
    /// Positive kWh drawn per charge slot
    pub charge: ScheduleDecision,
    /// Negative kWh delivered per discharge slot
    pub discharge: ScheduleDecision,
    pub final_soc_pct: f64,
    /// Grid energy of the charge slots from now on
    pub charged_kwh: f64,
    /// Energy of the discharge slots from now on
    pub discharged_kwh: f64,
    pub warnings: Vec<PassWarning>,
}

/// Chronological SOC walk over a partial horizon, in kWh
pub struct SocSimulator<'a> {
    battery: &'a BatteryState,
    from: usize,
    len: usize,
}

impl<'a> SocSimulator<'a> {
    pub fn new(battery: &'a BatteryState, from: usize, len: usize) -> Self {
        Self { battery, from, len }
    }

    /// Stored energy after each slot from `from` on
    pub fn trace(&self, charge: &BTreeMap<usize, f64>, discharge: &BTreeMap<usize, f64>) -> Vec<f64> {
        let eff = self.battery.round_trip_efficiency;
        let mut soc = self.battery.stored_kwh();
        (self.from..self.len)
            .map(|i| {
                if let Some(e) = charge.get(&i) {
                    soc += e * eff;
                }
                if let Some(e) = discharge.get(&i) {
                    soc -= e;
                }
                soc
            })
            .collect()
    }

    /// Final stored energy, or the first slot that leaves the SOC window
    pub fn check(
        &self,
        charge: &BTreeMap<usize, f64>,
        discharge: &BTreeMap<usize, f64>,
    ) -> Result<f64, SchedulingError> {
        let eff = self.battery.round_trip_efficiency;
        let (min, max) = (self.battery.min_kwh(), self.battery.max_kwh());
        let mut soc = self.battery.stored_kwh();
        for i in self.from..self.len {
            if let Some(e) = charge.get(&i) {
                soc += e * eff;
                if soc > max + SOC_TOLERANCE_KWH {
                    return Err(self.violation(i, soc));
                }
            }
            if let Some(e) = discharge.get(&i) {
                soc -= e;
                if soc < min - SOC_TOLERANCE_KWH {
                    return Err(self.violation(i, soc));
                }
            }
        }
        Ok(soc)
    }

    fn violation(&self, slot: usize, soc_kwh: f64) -> SchedulingError {
        SchedulingError::SocConstraintViolation {
            slot,
            soc_pct: self.battery.soc_pct_of(soc_kwh),
            min_pct: self.battery.min_soc_pct,
            max_pct: self.battery.max_soc_pct,
        }
    }
}

/// Working selection of the limiter: slot -> positive energy
#[derive(Debug, Clone, Default)]
struct Selection {
    charge: BTreeMap<usize, f64>,
    discharge: BTreeMap<usize, f64>,
}

impl Selection {
    fn charged(&self) -> f64 {
        self.charge.values().sum()
    }

    fn discharged(&self) -> f64 {
        self.discharge.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct CycleLimiter {
    charge_buffer_fraction: f64,
    /// Share of the predicted usage held back when sizing a discharge slot
    discharge_buffer_fraction: f64,
}

impl Default for CycleLimiter {
    fn default() -> Self {
        Self::new(0.20)
    }
}

impl CycleLimiter {
    pub fn new(charge_buffer_fraction: f64) -> Self {
        Self {
            charge_buffer_fraction,
            discharge_buffer_fraction: 0.20,
        }
    }

    pub fn with_discharge_buffer(mut self, fraction: f64) -> Self {
        self.discharge_buffer_fraction = fraction;
        self
    }

    /// `usage` holds the predicted consumption in kWh per slot index, where known.
    #[allow(clippy::too_many_arguments)]
    pub fn limit(
        &self,
        device_id: &DeviceId,
        horizon: &Horizon,
        candidates: &CandidateSets,
        battery: &BatteryState,
        locks: &BatteryLocks,
        now: DateTime<FixedOffset>,
        usage: &[Option<f64>],
    ) -> BatteryPlan {
        let n = horizon.len();
        let frozen = horizon.first_future_index(now);
        let charge_energy = battery.charge_rate_kw * horizon.slot_hours();
        let discharge_energy = |i: usize| match usage.get(i).copied().flatten() {
            Some(u) => charge_energy.min(u.max(0.0) * (1.0 - self.discharge_buffer_fraction)),
            None => charge_energy,
        };
        let sim = SocSimulator::new(battery, frozen, n);
        let mut warnings = Vec::new();

        // Past locks are kept verbatim; the SOC reading already reflects them
        let mut past = Selection::default();
        let mut base = Selection::default();
        for &i in locks.discharge.iter().filter(|&&i| i < n) {
            let target = if i < frozen { &mut past } else { &mut base };
            target.discharge.insert(i, discharge_energy(i));
        }
        for &i in locks.charge.iter().filter(|&&i| i < n) {
            if locks.discharge.contains(&i) {
                warn!(device = %device_id, slot = i, "slot locked for both actions, keeping discharge");
                continue;
            }
            let target = if i < frozen { &mut past } else { &mut base };
            target.charge.insert(i, charge_energy);
        }

        let selection = match sim.check(&base.charge, &base.discharge) {
            Ok(_) => self.select(device_id, &sim, base.clone(), candidates, frozen, charge_energy, &discharge_energy),
            Err(e) => {
                warn!(device = %device_id, error = %e, "locked battery plan infeasible, adding nothing");
                warnings.push(PassWarning::LockedPlanInfeasible {
                    device_id: device_id.clone(),
                    reason: e.to_string(),
                });
                base.clone()
            }
        };

        let selection = match sim.check(&selection.charge, &selection.discharge) {
            Ok(_) => selection,
            Err(e) if !warnings.is_empty() => {
                debug!(device = %device_id, error = %e, "locked plan kept as committed");
                selection
            }
            Err(e) => {
                error!(device = %device_id, error = %e, "limited plan breaks the SOC window, keeping locks only");
                debug_assert!(false, "cycle limiter produced an infeasible plan: {}", e);
                base
            }
        };

        let final_kwh = sim
            .trace(&selection.charge, &selection.discharge)
            .last()
            .copied()
            .unwrap_or_else(|| battery.stored_kwh());
        let charged_kwh = selection.charged();
        let discharged_kwh = selection.discharged();

        let mut charge_flows: BTreeMap<usize, f64> = past.charge;
        charge_flows.extend(selection.charge);
        let mut discharge_flows: BTreeMap<usize, f64> =
            past.discharge.into_iter().map(|(i, e)| (i, -e)).collect();
        discharge_flows.extend(selection.discharge.into_iter().map(|(i, e)| (i, -e)));

        info!(
            device = %device_id,
            charge_slots = charge_flows.len(),
            discharge_slots = discharge_flows.len(),
            charged_kwh,
            discharged_kwh,
            final_soc_pct = battery.soc_pct_of(final_kwh),
            "battery plan limited"
        );

        BatteryPlan {
            charge: ScheduleDecision::Battery {
                device_id: device_id.clone(),
                action: SlotAction::Charge,
                flows: charge_flows,
            },
            discharge: ScheduleDecision::Battery {
                device_id: device_id.clone(),
                action: SlotAction::Discharge,
                flows: discharge_flows,
            },
            final_soc_pct: battery.soc_pct_of(final_kwh),
            charged_kwh,
            discharged_kwh,
            warnings,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        device_id: &DeviceId,
        sim: &SocSimulator<'_>,
        base: Selection,
        candidates: &CandidateSets,
        frozen: usize,
        charge_energy: f64,
        discharge_energy: &dyn Fn(usize) -> f64,
    ) -> Selection {
        let mut current = base;

        let open = |i: usize, s: &Selection| i >= frozen && !s.charge.contains_key(&i) && !s.discharge.contains_key(&i);

        // Phase 1
        let mut rejected: Vec<usize> = Vec::new();
        for slot in &candidates.discharge.slots {
            if !open(slot.index, &current) {
                continue;
            }
            let energy = discharge_energy(slot.index);
            if energy <= SOC_TOLERANCE_KWH {
                debug!(device = %device_id, slot = slot.index, "no predicted usage, skipping discharge");
                continue;
            }
            current.discharge.insert(slot.index, energy);
            if sim.check(&current.charge, &current.discharge).is_ok() {
                debug!(device = %device_id, slot = slot.index, price = slot.price, "discharge accepted");
            } else {
                current.discharge.remove(&slot.index);
                rejected.push(slot.index);
            }
        }

        // Phase 2
        for slot in &candidates.charge.slots {
            if !open(slot.index, &current) {
                continue;
            }
            let mut trial = current.clone();
            trial.charge.insert(slot.index, charge_energy);
            if sim.check(&trial.charge, &trial.discharge).is_err() {
                debug!(device = %device_id, slot = slot.index, "charge rejected, battery would overfill");
                continue;
            }

            let mut revived = Vec::new();
            for &d in &rejected {
                trial.discharge.insert(d, discharge_energy(d));
                if sim.check(&trial.charge, &trial.discharge).is_ok() {
                    revived.push(d);
                } else {
                    trial.discharge.remove(&d);
                }
            }

            let allowed = trial.discharged() * (1.0 + self.charge_buffer_fraction);
            if trial.charged() > allowed + SOC_TOLERANCE_KWH {
                debug!(
                    device = %device_id,
                    slot = slot.index,
                    charged = trial.charged(),
                    allowed,
                    "charge rejected, exceeds discharge plus buffer"
                );
                continue;
            }

            debug!(device = %device_id, slot = slot.index, revived = revived.len(), "charge accepted");
            rejected.retain(|d| !revived.contains(d));
            current = trial;
        }

        current
    }
}
