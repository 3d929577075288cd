//! The thermal-cycling loop.
//!
//! For each setpoint: condition, wait for stability, dwell, run the primary
//! workload burst, optionally interleave power cycles with short bursts, then
//! file the results away. Phases run strictly one after another; the only
//! concurrency lives inside a workload burst.

pub mod plan;
pub mod stabilize;

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactCollector, ArtifactError};
use crate::chamber::{ChamberController, ChamberError};
use crate::config::{ConfigError, HarnessConfig, StabilizationConfig, TimeoutPolicy};
use crate::journal::{Journal, JournalEntry, JournalEvent};
use crate::power::{PowerCyclePlan, PowerCycleReport, PowerError, PowerSequencer};
use crate::workload::{WorkloadError, WorkloadOrchestrator, WorkloadReport, WorkloadTemplate};

pub use plan::{PlanError, SetpointPlan};
pub use stabilize::{wait_for_setpoint, StabilizationOutcome, StabilizationTarget};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid setpoint plan: {0}")]
    Plan(#[from] PlanError),

    #[error("chamber failure: {0}")]
    Chamber(#[from] ChamberError),

    #[error("power relay failure: {0}")]
    Power(PowerError),

    #[error("workload failure: {0}")]
    Workload(WorkloadError),

    #[error("artifact collection failed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("run journal unavailable: {0}")]
    Journal(String),

    #[error("chamber did not stabilize at {setpoint} (last reading {last_value})")]
    StabilizationTimeout { setpoint: f64, last_value: f64 },

    #[error("run cancelled")]
    Cancelled,
}

impl From<PowerError> for RunError {
    fn from(e: PowerError) -> Self {
        match e {
            PowerError::Cancelled => RunError::Cancelled,
            other => RunError::Power(other),
        }
    }
}

impl From<WorkloadError> for RunError {
    fn from(e: WorkloadError) -> Self {
        match e {
            WorkloadError::Cancelled => RunError::Cancelled,
            other => RunError::Workload(other),
        }
    }
}

impl RunError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) | RunError::Plan(_) => 2,
            RunError::Chamber(_) => 3,
            RunError::Power(_) => 4,
            RunError::Workload(_) => 5,
            RunError::Artifact(_) | RunError::Journal(_) => 6,
            RunError::StabilizationTimeout { .. } => 7,
            RunError::Cancelled => 130,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything the loop needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub stabilization: StabilizationConfig,
    pub dwell: Duration,
    pub rest_setpoint: f64,
    pub precondition_setpoint: Option<f64>,
    pub workload: WorkloadTemplate,
    pub replicas: usize,
    pub primary_duration: Duration,
    /// Power cycles per plateau, each followed by a short burst.
    pub power_cycles: u32,
    pub post_cycle_duration: Duration,
    pub power_plan: PowerCyclePlan,
}

impl CycleSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            stabilization: config.stabilization.clone(),
            dwell: config.plan.dwell(),
            rest_setpoint: config.plan.rest_setpoint,
            precondition_setpoint: config.plan.precondition_setpoint,
            workload: WorkloadTemplate::from_config(&config.workload),
            replicas: config.workload.replicas,
            primary_duration: config.workload.duration(),
            power_cycles: config.power.cycles_per_setpoint,
            post_cycle_duration: config.power.post_cycle_duration(),
            power_plan: PowerCyclePlan::from_config(&config.power),
        }
    }

    /// Worst-case wall time for one plateau, assuming stabilization uses its
    /// whole poll budget.
    pub fn estimated_plateau(&self, launch_stagger: Duration) -> Duration {
        let stagger = launch_stagger * self.replicas.saturating_sub(1) as u32;
        let margin = self.workload.safety_margin;
        let stabilize = self.stabilization.poll_interval() * self.stabilization.max_polls.saturating_sub(1);
        let primary = stagger + self.primary_duration + margin;
        let per_cycle = self.power_plan.total() + stagger + self.post_cycle_duration + margin;
        stabilize + self.dwell + primary + per_cycle * self.power_cycles
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BurstPhase {
    Primary,
    PostPowerCycle { cycle: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct BurstOutcome {
    pub phase: BurstPhase,
    pub report: WorkloadReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetpointOutcome {
    pub setpoint: f64,
    pub run_index: u32,
    pub stabilization: StabilizationOutcome,
    pub bursts: Vec<BurstOutcome>,
    pub power_cycles: Vec<PowerCycleReport>,
    pub artifact_dir: std::path::PathBuf,
}

impl SetpointOutcome {
    pub fn passed(&self) -> bool {
        self.bursts.iter().all(|b| b.report.passed())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub outcomes: Vec<SetpointOutcome>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(SetpointOutcome::passed)
    }

    pub fn stabilization_timeouts(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.stabilization.is_stable())
            .count()
    }

    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct CycleScheduler {
    chamber: Box<dyn ChamberController>,
    power: Option<PowerSequencer>,
    orchestrator: WorkloadOrchestrator,
    collector: ArtifactCollector,
    journal: Option<Journal>,
    settings: CycleSettings,
    session_id: Uuid,
}

impl CycleScheduler {
    pub fn new(
        chamber: Box<dyn ChamberController>,
        orchestrator: WorkloadOrchestrator,
        collector: ArtifactCollector,
        settings: CycleSettings,
    ) -> Self {
        Self {
            chamber,
            power: None,
            orchestrator,
            collector,
            journal: None,
            settings,
            session_id: Uuid::new_v4(),
        }
    }

    pub fn with_power(mut self, sequencer: PowerSequencer) -> Self {
        self.power = Some(sequencer);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Run every setpoint of `plan`, then park the chamber at the rest
    /// setpoint. The chamber is rested even when the run fails or is
    /// cancelled.
    pub async fn run(&mut self, plan: &SetpointPlan, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let started_at = Local::now();
        info!(
            session_id = %self.session_id,
            setpoints = ?plan.setpoints(),
            replicas = self.settings.replicas,
            power_cycles = self.settings.power_cycles,
            "starting thermal cycling session"
        );
        self.record(
            JournalEntry::new(self.session_id, JournalEvent::SessionStarted)
                .with_detail(json!({ "setpoints": plan.setpoints() })),
        )
        .await;

        let result = self.run_plan(plan, cancel).await;
        let rested = self.rest().await;

        match result {
            Ok(outcomes) => {
                rested?;
                let report = RunReport {
                    session_id: self.session_id,
                    started_at,
                    finished_at: Local::now(),
                    outcomes,
                };
                self.record(
                    JournalEntry::new(self.session_id, JournalEvent::SessionFinished)
                        .with_verdict(report.passed())
                        .with_detail(json!({
                            "setpoints": report.outcomes.len(),
                            "stabilization_timeouts": report.stabilization_timeouts(),
                        })),
                )
                .await;
                info!(
                    session_id = %self.session_id,
                    passed = report.passed(),
                    setpoints = report.outcomes.len(),
                    "thermal cycling session finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "thermal cycling session aborted");
                self.record(
                    JournalEntry::new(self.session_id, JournalEvent::SessionAborted)
                        .with_detail(json!({ "error": e.to_string(), "exit_code": e.exit_code() })),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_plan(&mut self, plan: &SetpointPlan, cancel: &CancellationToken) -> Result<Vec<SetpointOutcome>, RunError> {
        if self.settings.power_cycles > 0 && self.power.is_none() {
            return Err(missing_relay());
        }

        if let Some(setpoint) = self.settings.precondition_setpoint {
            info!(setpoint, "preconditioning chamber");
            self.approach(setpoint, cancel).await?;
        }

        let mut run_index = self.collector.next_run_index()?;
        let mut outcomes = Vec::with_capacity(plan.len());
        for setpoint in plan.iter() {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            outcomes.push(self.run_setpoint(setpoint, run_index, cancel).await?);
            run_index += 1;
        }
        Ok(outcomes)
    }

    async fn run_setpoint(
        &mut self,
        setpoint: f64,
        run_index: u32,
        cancel: &CancellationToken,
    ) -> Result<SetpointOutcome, RunError> {
        let stabilization = self.approach(setpoint, cancel).await?;

        info!(setpoint, dwell_sec = self.settings.dwell.as_secs(), "dwelling at setpoint");
        sleep_or_cancel(self.settings.dwell, cancel).await?;
        self.record(JournalEntry::new(self.session_id, JournalEvent::DwellCompleted).with_setpoint(setpoint))
            .await;

        let mut bursts = vec![
            self.burst(setpoint, BurstPhase::Primary, self.settings.primary_duration, cancel)
                .await?,
        ];

        let mut power_cycles = Vec::new();
        for cycle in 1..=self.settings.power_cycles {
            let sequencer = self.power.as_mut().ok_or_else(missing_relay)?;
            let report = sequencer.cycle(&self.settings.power_plan, cancel).await?;
            self.record(
                JournalEntry::new(self.session_id, JournalEvent::PowerCycled)
                    .with_setpoint(setpoint)
                    .with_detail(json!({ "cycle": cycle, "total_sec": report.total_sec })),
            )
            .await;
            power_cycles.push(report);

            let phase = BurstPhase::PostPowerCycle { cycle };
            bursts.push(
                self.burst(setpoint, phase, self.settings.post_cycle_duration, cancel)
                    .await?,
            );
        }

        let artifact = self.collector.collect(run_index, setpoint, Local::now())?;
        let outcome = SetpointOutcome {
            setpoint,
            run_index,
            stabilization,
            bursts,
            power_cycles,
            artifact_dir: artifact.directory,
        };
        self.record(
            JournalEntry::new(self.session_id, JournalEvent::ArtifactsCollected)
                .with_setpoint(setpoint)
                .with_run_index(run_index)
                .with_verdict(outcome.passed())
                .with_detail(json!({
                    "directory": outcome.artifact_dir,
                    "files": artifact.files.len(),
                })),
        )
        .await;

        Ok(outcome)
    }

    /// Command the chamber to `setpoint` and wait for it, applying the
    /// configured timeout policy.
    async fn approach(&mut self, setpoint: f64, cancel: &CancellationToken) -> Result<StabilizationOutcome, RunError> {
        self.chamber.set_target(setpoint).await?;
        self.chamber.start_conditioning().await?;
        self.record(JournalEntry::new(self.session_id, JournalEvent::SetpointCommanded).with_setpoint(setpoint))
            .await;

        let target = StabilizationTarget::from_config(setpoint, &self.settings.stabilization);
        let outcome = wait_for_setpoint(self.chamber.as_mut(), &target, cancel).await?;

        match outcome {
            StabilizationOutcome::Stable { value, polls } => {
                self.record(
                    JournalEntry::new(self.session_id, JournalEvent::Stabilized)
                        .with_setpoint(setpoint)
                        .with_detail(json!({ "value": value, "polls": polls })),
                )
                .await;
            }
            StabilizationOutcome::TimedOut { last_value, polls } => {
                self.record(
                    JournalEntry::new(self.session_id, JournalEvent::StabilizationTimedOut)
                        .with_setpoint(setpoint)
                        .with_detail(json!({ "last_value": last_value, "polls": polls })),
                )
                .await;
                match self.settings.stabilization.on_timeout {
                    TimeoutPolicy::Abort => {
                        return Err(RunError::StabilizationTimeout { setpoint, last_value });
                    }
                    TimeoutPolicy::Continue => {
                        warn!(setpoint, last_value, "continuing without stabilization");
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn burst(
        &mut self,
        setpoint: f64,
        phase: BurstPhase,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<BurstOutcome, RunError> {
        let spec = self.settings.workload.render(setpoint, duration);
        info!(setpoint, ?phase, duration_sec = duration.as_secs(), "running workload burst");
        let report = self
            .orchestrator
            .execute(&spec, self.settings.replicas, cancel)
            .await?;

        self.record(
            JournalEntry::new(self.session_id, JournalEvent::WorkloadCompleted)
                .with_setpoint(setpoint)
                .with_verdict(report.passed())
                .with_detail(json!({
                    "phase": phase,
                    "failures": report.failures(),
                    "elapsed_sec": report.elapsed_sec,
                })),
        )
        .await;

        Ok(BurstOutcome { phase, report })
    }

    async fn rest(&mut self) -> Result<(), RunError> {
        let setpoint = self.settings.rest_setpoint;
        match self.chamber.set_target(setpoint).await {
            Ok(()) => {
                info!(setpoint, "chamber returned to rest setpoint");
                Ok(())
            }
            Err(e) => {
                error!(setpoint, error = %e, "failed to return chamber to rest setpoint");
                Err(e.into())
            }
        }
    }

    /// Journal writes never fail the run.
    async fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(entry).await {
                warn!(path = %journal.path().display(), error = %e, "failed to write run journal");
            }
        }
    }
}

fn missing_relay() -> RunError {
    RunError::Config(ConfigError::Invalid {
        field: "power.cycles_per_setpoint",
        reason: "power cycling requested but no relay channel is configured".to_string(),
    })
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), RunError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
