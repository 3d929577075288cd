//! chambercycle -- thermal-cycling and power-cycling endurance harness.
//!
//! Drives an environmental chamber through a setpoint plan and, at each
//! plateau, exercises the device under test with concurrent workload
//! replicas interleaved with DC power cycles. Result files are filed into
//! one directory per run.

pub mod artifacts;
pub mod chamber;
pub mod config;
pub mod cycle;
pub mod journal;
pub mod power;
pub mod workload;

use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactCollector;
use crate::config::HarnessConfig;
use crate::cycle::{CycleScheduler, CycleSettings, RunError, RunReport, SetpointPlan};
use crate::journal::Journal;
use crate::power::{CommandRelay, PowerSequencer};
use crate::workload::WorkloadOrchestrator;

/// Validate `config` and build its setpoint plan.
pub fn build_plan(config: &HarnessConfig) -> Result<SetpointPlan, RunError> {
    config.validate()?;
    Ok(SetpointPlan::from_config(&config.plan)?)
}

/// Connect to the chamber and assemble a scheduler from `config`.
pub async fn build_scheduler(config: &HarnessConfig, simulate: bool) -> Result<CycleScheduler, RunError> {
    let chamber = chamber::connect(&config.chamber, simulate).await?;
    let orchestrator = WorkloadOrchestrator::new(config.workload.launch_stagger());
    let collector = ArtifactCollector::from_config(&config.results);

    let mut scheduler = CycleScheduler::new(chamber, orchestrator, collector, CycleSettings::from_config(config));

    if config.power.cycles_per_setpoint > 0 {
        let relay = CommandRelay::from_config(&config.power);
        scheduler = scheduler.with_power(PowerSequencer::new(Box::new(relay)));
    }

    if let Some(path) = &config.results.journal_path {
        let journal = Journal::open(path.clone())
            .await
            .map_err(|e| RunError::Journal(format!("{e:#}")))?;
        scheduler = scheduler.with_journal(journal);
    }

    Ok(scheduler)
}

/// Run a full session described by `config`.
pub async fn run_session(
    config: &HarnessConfig,
    simulate: bool,
    cancel: &CancellationToken,
) -> Result<RunReport, RunError> {
    let plan = build_plan(config)?;
    let mut scheduler = build_scheduler(config, simulate).await?;
    scheduler.run(&plan, cancel).await
}
