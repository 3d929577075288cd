//! Workload replica spawning and supervision.
//!
//! A burst launches N copies of the endurance program, staggered so they do
//! not all hit the DUT at the same instant. Each replica gets its own
//! supervisor task that resolves on exit, on its deadline, or on
//! cancellation. The burst itself is never reported before the shared
//! deadline (`expected_duration + safety_margin` after the last launch) has
//! passed, and never before every supervisor has resolved.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkloadConfig;

/// Grace period between SIGTERM and SIGKILL for a replica past its deadline.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const REPLICA_PLACEHOLDER: &str = "{replica}";

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to spawn replica {replica} ({executable}): {source}")]
    Spawn {
        replica: usize,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open output log {path}: {source}")]
    OutputLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("replica supervisor failed: {0}")]
    Supervisor(#[from] tokio::task::JoinError),

    #[error("workload burst cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Argument template rendered per setpoint.
#[derive(Debug, Clone)]
pub struct WorkloadTemplate {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub safety_margin: Duration,
    pub tc_tolerance: f64,
    pub working_dir: Option<PathBuf>,
    pub capture_output: bool,
}

impl WorkloadTemplate {
    pub fn from_config(config: &WorkloadConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            safety_margin: config.safety_margin(),
            tc_tolerance: config.tc_tolerance,
            working_dir: Some(config.working_dir.clone()),
            capture_output: config.capture_output,
        }
    }

    /// Substitute every placeholder except `{replica}`, which is filled in
    /// at spawn time.
    pub fn render(&self, setpoint: f64, duration: Duration) -> WorkloadSpec {
        let duration_sec = duration.as_secs().to_string();
        let setpoint_str = setpoint.to_string();
        let upper = (setpoint + self.tc_tolerance).to_string();
        let lower = (setpoint - self.tc_tolerance).to_string();

        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{duration_sec}", &duration_sec)
                    .replace("{setpoint}", &setpoint_str)
                    .replace("{upper_bound}", &upper)
                    .replace("{lower_bound}", &lower)
            })
            .collect();

        WorkloadSpec {
            executable: self.executable.clone(),
            args,
            expected_duration: duration,
            safety_margin: self.safety_margin,
            working_dir: self.working_dir.clone(),
            capture_output: self.capture_output,
        }
    }
}

/// One burst's command line, shared read-only by every replica.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub executable: PathBuf,
    /// May still contain `{replica}`.
    pub args: Vec<String>,
    pub expected_duration: Duration,
    pub safety_margin: Duration,
    pub working_dir: Option<PathBuf>,
    pub capture_output: bool,
}

impl WorkloadSpec {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>, expected_duration: Duration, safety_margin: Duration) -> Self {
        Self {
            executable: executable.into(),
            args,
            expected_duration,
            safety_margin,
            working_dir: None,
            capture_output: false,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn capturing_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Time budget from launch to the point a replica counts as unresponsive.
    pub fn deadline(&self) -> Duration {
        self.expected_duration + self.safety_margin
    }

    /// Arguments for 1-based replica `index`.
    pub fn args_for(&self, index: usize) -> Vec<String> {
        let idx = index.to_string();
        self.args
            .iter()
            .map(|a| a.replace(REPLICA_PLACEHOLDER, &idx))
            .collect()
    }

    fn command(&self, index: usize) -> Result<Command, WorkloadError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(self.args_for(index))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        if self.capture_output {
            let dir = self.working_dir.as_deref().unwrap_or(Path::new("."));
            let path = dir.join(format!("replica{}.log", index));
            let log = std::fs::File::create(&path)
                .map_err(|source| WorkloadError::OutputLog { path: path.clone(), source })?;
            let log_err = log
                .try_clone()
                .map_err(|source| WorkloadError::OutputLog { path, source })?;
            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplicaStatus {
    Passed,
    /// Non-zero exit. `code` is `None` when the process died from a signal.
    Failed { code: Option<i32> },
    /// Still running at its deadline; terminated.
    Unresponsive,
    /// Exit status could not be collected.
    Lost { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaOutcome {
    pub replica: usize,
    pub pid: Option<u32>,
    pub status: ReplicaStatus,
    pub elapsed_sec: f64,
}

impl ReplicaOutcome {
    pub fn passed(&self) -> bool {
        self.status == ReplicaStatus::Passed
    }
}

/// Aggregated result of one burst.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    /// Sorted by replica index.
    pub replicas: Vec<ReplicaOutcome>,
    pub elapsed_sec: f64,
}

impl WorkloadReport {
    pub fn passed(&self) -> bool {
        !self.replicas.is_empty() && self.replicas.iter().all(ReplicaOutcome::passed)
    }

    pub fn failures(&self) -> usize {
        self.replicas.iter().filter(|r| !r.passed()).count()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkloadOrchestrator {
    launch_stagger: Duration,
}

impl WorkloadOrchestrator {
    pub fn new(launch_stagger: Duration) -> Self {
        Self { launch_stagger }
    }

    pub fn launch_stagger(&self) -> Duration {
        self.launch_stagger
    }

    /// Run `replicas` copies of `spec` and collect every outcome.
    ///
    /// A spawn failure aborts the burst; replicas already running are
    /// killed when their supervisors are dropped.
    pub async fn execute(
        &self,
        spec: &WorkloadSpec,
        replicas: usize,
        cancel: &CancellationToken,
    ) -> Result<WorkloadReport, WorkloadError> {
        let started = Instant::now();
        let budget = spec.deadline();
        let mut supervisors = JoinSet::new();

        info!(
            executable = %spec.executable.display(),
            replicas,
            expected_sec = spec.expected_duration.as_secs_f64(),
            margin_sec = spec.safety_margin.as_secs_f64(),
            "starting workload burst"
        );

        for index in 1..=replicas {
            if index > 1 && !self.launch_stagger.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        drain(&mut supervisors).await;
                        return Err(WorkloadError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.launch_stagger) => {}
                }
            }

            let child = spec
                .command(index)?
                .spawn()
                .map_err(|source| WorkloadError::Spawn {
                    replica: index,
                    executable: spec.executable.display().to_string(),
                    source,
                })?;

            debug!(replica = index, pid = child.id(), "replica launched");
            supervisors.spawn(supervise(index, child, Instant::now() + budget, cancel.clone()));
        }

        // All replicas are running; hold until the shared deadline.
        let deadline = Instant::now() + budget;
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep_until(deadline) => false,
        };

        let mut outcomes = Vec::with_capacity(replicas);
        while let Some(joined) = supervisors.join_next().await {
            outcomes.push(joined?);
        }
        if cancelled {
            return Err(WorkloadError::Cancelled);
        }
        outcomes.sort_by_key(|o| o.replica);

        let report = WorkloadReport {
            replicas: outcomes,
            elapsed_sec: started.elapsed().as_secs_f64(),
        };

        if report.passed() {
            info!(replicas, elapsed_sec = report.elapsed_sec, "workload burst passed");
        } else {
            warn!(
                replicas,
                failures = report.failures(),
                elapsed_sec = report.elapsed_sec,
                "workload burst failed"
            );
        }
        Ok(report)
    }
}

/// Wait out supervisors after a cancellation so their children are reaped.
async fn drain(supervisors: &mut JoinSet<ReplicaOutcome>) {
    while supervisors.join_next().await.is_some() {}
}

/// Resolve one replica: exit, deadline, or cancellation, whichever is first.
async fn supervise(replica: usize, mut child: Child, deadline: Instant, cancel: CancellationToken) -> ReplicaOutcome {
    let started = Instant::now();
    let pid = child.id();

    let status = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            debug!(replica, "cancellation received, terminating replica");
            terminate_child(&mut child).await;
            ReplicaStatus::Cancelled
        }

        exit = child.wait() => match exit {
            Ok(exit) if exit.success() => ReplicaStatus::Passed,
            Ok(exit) => {
                warn!(replica, exit_code = exit.code(), "replica reported failure");
                ReplicaStatus::Failed { code: exit.code() }
            }
            Err(e) => ReplicaStatus::Lost { reason: e.to_string() },
        },

        _ = tokio::time::sleep_until(deadline) => {
            warn!(replica, ?pid, "replica still running at deadline, terminating");
            terminate_child(&mut child).await;
            ReplicaStatus::Unresponsive
        }
    };

    ReplicaOutcome {
        replica,
        pid,
        status,
        elapsed_sec: started.elapsed().as_secs_f64(),
    }
}

/// Send SIGTERM, wait up to [`TERMINATE_GRACE`], then SIGKILL.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "replica exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for replica after SIGTERM");
        }
        Err(_) => {
            warn!("replica ignored SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL replica");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
