use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::actions::{window_variables, ActionSet, Edge, ResolvedAction};
use crate::config::Config;
use crate::domain::{ActionWindow, DeviceId, Schedule, SlotAction};

/// Consumer of finished schedules. How actions reach devices is up to the implementation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, schedule: &Schedule) -> Result<()>;
}

/// Resolved start and stop actions of one window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowCommands {
    pub window: ActionWindow,
    pub start: Vec<ResolvedAction>,
    pub stop: Vec<ResolvedAction>,
}

/// Logs every window with its resolved actions as structured events
#[derive(Debug, Clone, Default)]
pub struct LogDispatcher {
    actions: BTreeMap<(DeviceId, SlotAction), ActionSet>,
}

impl LogDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actions(mut self, device_id: impl Into<DeviceId>, action: SlotAction, set: ActionSet) -> Self {
        self.actions.insert((device_id.into(), action), set);
        self
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut dispatcher = Self::new();
        for device in &cfg.devices {
            for action in [SlotAction::Run, SlotAction::Charge, SlotAction::Discharge] {
                if let Some(set) = device.actions_for(action) {
                    dispatcher = dispatcher.with_actions(device.id(), action, set.clone());
                }
            }
        }
        dispatcher
    }

    /// Windows whose actions fail to resolve are returned with no commands
    pub fn commands(&self, schedule: &Schedule) -> Vec<WindowCommands> {
        schedule
            .windows()
            .map(|window| {
                let key = (window.device_id.clone(), window.action);
                let (start, stop) = match self.actions.get(&key) {
                    Some(set) => {
                        let vars = window_variables(window);
                        let resolved = set
                            .resolve(Edge::Start, &vars)
                            .and_then(|start| Ok((start, set.resolve(Edge::Stop, &vars)?)));
                        match resolved {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(device = %window.device_id, action = %window.action, error = %e, "action resolution failed");
                                (Vec::new(), Vec::new())
                            }
                        }
                    }
                    None => (Vec::new(), Vec::new()),
                };
                WindowCommands {
                    window: window.clone(),
                    start,
                    stop,
                }
            })
            .collect()
    }
}

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, schedule: &Schedule) -> Result<()> {
        for cmd in self.commands(schedule) {
            info!(
                device = %cmd.window.device_id,
                action = %cmd.window.action,
                start = %cmd.window.start,
                end = %cmd.window.end,
                energy_kwh = cmd.window.energy_kwh,
                on_start = %serde_json::to_string(&cmd.start)?,
                on_stop = %serde_json::to_string(&cmd.stop)?,
                "window scheduled"
            );
        }
        info!(schedule = %schedule.id, version = %schedule.optimizer_version, "schedule dispatched");
        Ok(())
    }
}
