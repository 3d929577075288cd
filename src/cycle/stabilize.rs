//! Waiting for the chamber to reach a setpoint.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chamber::ChamberController;
use crate::config::StabilizationConfig;

use super::RunError;

/// What "stable" means for one setpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilizationTarget {
    pub target: f64,
    /// Half-width of the acceptance band, strictly positive.
    pub band: f64,
    pub poll_interval: Duration,
    /// Number of out-of-band samples after which the wait gives up.
    pub max_polls: u32,
}

impl StabilizationTarget {
    pub fn new(target: f64, band: f64, poll_interval: Duration, max_polls: u32) -> Self {
        debug_assert!(band > 0.0, "stabilization band must be positive");
        debug_assert!(max_polls > 0, "stabilization needs at least one poll");
        Self {
            target,
            band,
            poll_interval,
            max_polls,
        }
    }

    pub fn from_config(target: f64, config: &StabilizationConfig) -> Self {
        Self::new(
            target,
            config.compare_band,
            config.poll_interval(),
            config.max_polls,
        )
    }

    /// Inclusive band check: `target - band <= value <= target + band`.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.target - self.band && value <= self.target + self.band
    }

    /// Longest time a wait on this target can take, excluding chamber I/O.
    pub fn max_wait(&self) -> Duration {
        self.poll_interval * self.max_polls.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StabilizationOutcome {
    /// A sample landed in band.
    Stable { value: f64, polls: u32 },
    /// `max_polls` samples were all out of band.
    TimedOut { last_value: f64, polls: u32 },
}

impl StabilizationOutcome {
    pub fn is_stable(&self) -> bool {
        matches!(self, StabilizationOutcome::Stable { .. })
    }

    pub fn polls(&self) -> u32 {
        match self {
            StabilizationOutcome::Stable { polls, .. } | StabilizationOutcome::TimedOut { polls, .. } => *polls,
        }
    }
}

/// Sample the chamber until the air reading is in band or `max_polls`
/// samples have been taken. Sleeps `poll_interval` between samples, never
/// after the last one.
pub async fn wait_for_setpoint(
    chamber: &mut dyn ChamberController,
    target: &StabilizationTarget,
    cancel: &CancellationToken,
) -> Result<StabilizationOutcome, RunError> {
    info!(
        setpoint = target.target,
        band = target.band,
        max_polls = target.max_polls,
        "waiting for chamber to stabilize"
    );

    let mut last_value = f64::NAN;
    for poll in 1..=target.max_polls {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let reading = chamber.sample().await?;
        last_value = reading.air;

        if target.contains(reading.air) {
            info!(setpoint = target.target, air = reading.air, polls = poll, "chamber stabilized");
            return Ok(StabilizationOutcome::Stable {
                value: reading.air,
                polls: poll,
            });
        }

        debug!(setpoint = target.target, air = reading.air, poll, "chamber out of band");

        if poll < target.max_polls {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                _ = tokio::time::sleep(target.poll_interval) => {}
            }
        }
    }

    warn!(
        setpoint = target.target,
        last_value,
        polls = target.max_polls,
        "chamber did not stabilize within the poll bound"
    );
    Ok(StabilizationOutcome::TimedOut {
        last_value,
        polls: target.max_polls,
    })
}
