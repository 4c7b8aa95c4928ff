use anyhow::{Context, Result};
use chrono::Local;
use price_scheduler::controller::{
    Dispatcher, LogDispatcher, PeriodicTaskConfig, Planner, TaskScheduler,
};
use price_scheduler::{config::Config, telemetry};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load().context("configuration load failed")?;
    if cfg.devices.is_empty() {
        warn!("no devices configured, schedules will be empty");
    }

    let planner = Arc::new(Planner::from_config(&cfg).await?);
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(LogDispatcher::from_config(&cfg));

    if cfg.planner.run_once {
        let report = planner.run_full_pass(Local::now().fixed_offset()).await?;
        for warning in &report.warnings {
            warn!(%warning, "pass warning");
        }
        dispatcher.dispatch(&report.schedule).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(devices = cfg.devices.len(), "starting price scheduler");
    let scheduler = Arc::new(TaskScheduler::with_config(
        planner,
        dispatcher,
        PeriodicTaskConfig::from(&cfg.planner),
    ));
    let tasks = scheduler.clone().start();

    telemetry::shutdown_signal().await;
    for task in tasks {
        task.abort();
    }

    info!("shutdown complete");
    Ok(())
}
