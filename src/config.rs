use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actions::ActionSet;
use crate::domain::{blocks_for, AllowedWindow, BatteryState, DeviceKind, DeviceScheduleRequest, SlotAction};
use crate::error::SchedulingError;
use crate::optimizer::{BatteryEconomics, ThresholdConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub battery: BatteryEconomics,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub files: FilesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub slot_minutes: u32,
    pub horizon_hours: u32,
    pub lock_hours: u32,
    pub default_gap_hours: u32,
    pub solver_timeout_ms: u64,
    pub full_pass_every_minutes: u64,
    pub battery_pass_every_minutes: u64,
    pub price_cache_seconds: u64,
    /// Run one full pass and exit
    pub run_once: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            slot_minutes: 15,
            horizon_hours: 24,
            lock_hours: 2,
            default_gap_hours: 4,
            solver_timeout_ms: 2000,
            full_pass_every_minutes: 1440,
            battery_pass_every_minutes: 15,
            price_cache_seconds: 300,
            run_once: false,
        }
    }
}

impl PlannerConfig {
    pub fn solver_timeout(&self) -> Duration {
        Duration::from_millis(self.solver_timeout_ms)
    }

    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.horizon_hours))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConfig {
    HeatPump(ThermalDeviceConfig),
    HotWater(ThermalDeviceConfig),
    Battery(BatteryDeviceConfig),
}

impl DeviceConfig {
    pub fn id(&self) -> &str {
        match self {
            DeviceConfig::HeatPump(d) | DeviceConfig::HotWater(d) => &d.id,
            DeviceConfig::Battery(b) => &b.id,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceConfig::HeatPump(_) => DeviceKind::HeatPump,
            DeviceConfig::HotWater(_) => DeviceKind::HotWater,
            DeviceConfig::Battery(_) => DeviceKind::Battery,
        }
    }

    /// Action set run for windows of `action`
    pub fn actions_for(&self, action: SlotAction) -> Option<&ActionSet> {
        match (self, action) {
            (DeviceConfig::HeatPump(d) | DeviceConfig::HotWater(d), SlotAction::Run) => Some(&d.actions),
            (DeviceConfig::Battery(b), SlotAction::Charge) => Some(&b.charge_actions),
            (DeviceConfig::Battery(b), SlotAction::Discharge) => Some(&b.discharge_actions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThermalDeviceConfig {
    pub id: String,
    /// Run time required per horizon
    pub block_minutes: u32,
    #[serde(default)]
    pub min_gap_minutes: u32,
    #[serde(default)]
    pub max_gap_minutes: Option<u32>,
    #[serde(default)]
    pub allowed_window: AllowedWindow,
    #[serde(default)]
    pub actions: ActionSet,
}

impl ThermalDeviceConfig {
    pub fn request(&self, kind: DeviceKind, slot_minutes: u32) -> DeviceScheduleRequest {
        let mut request = DeviceScheduleRequest::new(
            self.id.clone(),
            kind,
            self.block_minutes,
            slot_minutes,
            blocks_for(self.min_gap_minutes, slot_minutes),
        )
        .with_window(self.allowed_window);
        if let Some(max_gap) = self.max_gap_minutes.filter(|_| slot_minutes > 0) {
            request = request.with_max_gap((max_gap / slot_minutes) as usize);
        }
        request
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryDeviceConfig {
    pub id: String,
    pub capacity_kwh: f64,
    #[serde(default = "default_min_soc")]
    pub min_soc_pct: f64,
    #[serde(default = "default_max_soc")]
    pub max_soc_pct: f64,
    pub charge_rate_kw: f64,
    /// SOC assumed until a reading is available
    #[serde(default = "default_initial_soc")]
    pub initial_soc_pct: f64,
    #[serde(default)]
    pub charge_actions: ActionSet,
    #[serde(default)]
    pub discharge_actions: ActionSet,
}

fn default_min_soc() -> f64 {
    20.0
}

fn default_max_soc() -> f64 {
    90.0
}

fn default_initial_soc() -> f64 {
    50.0
}

impl BatteryDeviceConfig {
    pub fn state(&self, current_soc_pct: f64, round_trip_efficiency: f64) -> BatteryState {
        BatteryState {
            capacity_kwh: self.capacity_kwh,
            min_soc_pct: self.min_soc_pct,
            max_soc_pct: self.max_soc_pct,
            charge_rate_kw: self.charge_rate_kw,
            current_soc_pct,
            round_trip_efficiency,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub prices: PathBuf,
    pub history: Option<PathBuf>,
    pub state: PathBuf,
    /// JSON array of 24 hourly load values in kW
    pub forecast: Option<PathBuf>,
    /// JSON object of battery id to SOC percent
    pub soc: Option<PathBuf>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            prices: PathBuf::from("data/prices.json"),
            history: Some(PathBuf::from("data/price_history.json")),
            state: PathBuf::from("data/state.json"),
            forecast: None,
            soc: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCHED__").split("__"));
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulingError> {
        let invalid = SchedulingError::InvalidConfig;
        let p = &self.planner;
        if p.slot_minutes == 0 {
            return Err(invalid("planner.slot_minutes must be positive".into()));
        }
        if p.horizon_hours == 0 || (p.horizon_hours * 60) % p.slot_minutes != 0 {
            return Err(invalid(format!(
                "planner.horizon_hours ({}) must be a positive whole number of {}-minute slots",
                p.horizon_hours, p.slot_minutes
            )));
        }
        if p.full_pass_every_minutes == 0 || p.battery_pass_every_minutes == 0 {
            return Err(invalid("pass cadences must be positive".into()));
        }
        self.thresholds
            .validate()
            .map_err(|e| invalid(format!("thresholds: {}", e)))?;
        self.battery
            .validate()
            .map_err(|e| invalid(format!("battery: {}", e)))?;

        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if device.id().is_empty() {
                return Err(invalid("device id must not be empty".into()));
            }
            if !seen.insert(device.id()) {
                return Err(invalid(format!("duplicate device id '{}'", device.id())));
            }
            match device {
                DeviceConfig::HeatPump(d) | DeviceConfig::HotWater(d) => {
                    if d.block_minutes == 0 {
                        return Err(invalid(format!("{}: block_minutes must be positive", d.id)));
                    }
                    if let Some(max_gap) = d.max_gap_minutes {
                        if max_gap < d.min_gap_minutes {
                            return Err(invalid(format!(
                                "{}: max_gap_minutes ({}) below min_gap_minutes ({})",
                                d.id, max_gap, d.min_gap_minutes
                            )));
                        }
                    }
                }
                DeviceConfig::Battery(b) => {
                    b.state(b.initial_soc_pct, self.battery.round_trip_efficiency)
                        .validate()
                        .map_err(|e| match e {
                            SchedulingError::InvalidConfig(msg) => invalid(format!("{}: {}", b.id, msg)),
                            other => other,
                        })?;
                }
            }
        }
        Ok(())
    }

    pub fn thermal_devices(&self) -> impl Iterator<Item = (DeviceKind, &ThermalDeviceConfig)> {
        self.devices.iter().filter_map(|d| match d {
            DeviceConfig::HeatPump(t) => Some((DeviceKind::HeatPump, t)),
            DeviceConfig::HotWater(t) => Some((DeviceKind::HotWater, t)),
            DeviceConfig::Battery(_) => None,
        })
    }

    pub fn batteries(&self) -> impl Iterator<Item = &BatteryDeviceConfig> {
        self.devices.iter().filter_map(|d| match d {
            DeviceConfig::Battery(b) => Some(b),
            _ => None,
        })
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id() == id)
    }
}
