//! DUT power cycling through an external relay command channel.
//!
//! Open loop: off, settle, on, settle. Nothing here checks that the DUT
//! actually lost or regained power; the only failures detected are those of
//! the relay commands themselves.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PowerConfig;

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("failed to run relay command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay command `{command}` exited with code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("power cycle cancelled")]
    Cancelled,
}

/// Settle delays for one off/on cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerCyclePlan {
    pub off_settle: Duration,
    /// DUT boot time.
    pub on_settle: Duration,
}

impl PowerCyclePlan {
    pub fn from_config(config: &PowerConfig) -> Self {
        Self {
            off_settle: config.off_settle(),
            on_settle: config.on_settle(),
        }
    }

    pub fn total(&self) -> Duration {
        self.off_settle + self.on_settle
    }
}

/// Relay actions. Implementations report only whether the command channel
/// accepted the request.
#[async_trait::async_trait]
pub trait RelayChannel: Send {
    async fn power_off(&mut self) -> Result<(), PowerError>;
    async fn power_on(&mut self) -> Result<(), PowerError>;
}

/// Relay driven by shell commands, e.g. a vendor relay CLI.
#[derive(Debug, Clone)]
pub struct CommandRelay {
    shell: String,
    off_commands: Vec<String>,
    on_commands: Vec<String>,
}

impl CommandRelay {
    pub fn new(shell: impl Into<String>, off_commands: Vec<String>, on_commands: Vec<String>) -> Self {
        Self {
            shell: shell.into(),
            off_commands,
            on_commands,
        }
    }

    pub fn from_config(config: &PowerConfig) -> Self {
        Self::new(
            config.shell.clone(),
            config.off_commands.clone(),
            config.on_commands.clone(),
        )
    }

    async fn run_all(&self, commands: &[String]) -> Result<(), PowerError> {
        for command in commands {
            debug!(%command, "running relay command");
            let status = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .kill_on_drop(true)
                .status()
                .await
                .map_err(|source| PowerError::Spawn {
                    command: command.clone(),
                    source,
                })?;

            if !status.success() {
                return Err(PowerError::CommandFailed {
                    command: command.clone(),
                    code: status.code(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelayChannel for CommandRelay {
    async fn power_off(&mut self) -> Result<(), PowerError> {
        self.run_all(&self.off_commands).await
    }

    async fn power_on(&mut self) -> Result<(), PowerError> {
        self.run_all(&self.on_commands).await
    }
}

/// Timings observed during one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PowerCycleReport {
    /// From the end of the power-off commands to the start of power-on.
    pub off_duration_sec: f64,
    pub total_sec: f64,
}

pub struct PowerSequencer {
    relay: Box<dyn RelayChannel>,
}

impl PowerSequencer {
    pub fn new(relay: Box<dyn RelayChannel>) -> Self {
        Self { relay }
    }

    /// Power off, wait `off_settle`, power on, wait `on_settle`.
    pub async fn cycle(
        &mut self,
        plan: &PowerCyclePlan,
        cancel: &CancellationToken,
    ) -> Result<PowerCycleReport, PowerError> {
        let started = Instant::now();
        info!(
            off_settle_sec = plan.off_settle.as_secs_f64(),
            on_settle_sec = plan.on_settle.as_secs_f64(),
            "power cycling DUT"
        );

        self.relay.power_off().await?;
        let off_at = Instant::now();
        if !settle(plan.off_settle, cancel).await {
            warn!("power cycle cancelled while DUT is off; leaving it powered down");
            return Err(PowerError::Cancelled);
        }

        let on_at = Instant::now();
        self.relay.power_on().await?;
        if !settle(plan.on_settle, cancel).await {
            return Err(PowerError::Cancelled);
        }

        let report = PowerCycleReport {
            off_duration_sec: (on_at - off_at).as_secs_f64(),
            total_sec: started.elapsed().as_secs_f64(),
        };
        info!(total_sec = report.total_sec, "power cycle complete");
        Ok(report)
    }
}

/// Sleep for `delay`; `false` if cancelled first.
async fn settle(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(&'static str, std::time::Instant)>>>;

    struct RecordingRelay {
        log: Log,
    }

    #[async_trait::async_trait]
    impl RelayChannel for RecordingRelay {
        async fn power_off(&mut self) -> Result<(), PowerError> {
            self.log.lock().unwrap().push(("off", std::time::Instant::now()));
            Ok(())
        }

        async fn power_on(&mut self) -> Result<(), PowerError> {
            self.log.lock().unwrap().push(("on", std::time::Instant::now()));
            Ok(())
        }
    }

    fn plan(off_ms: u64, on_ms: u64) -> PowerCyclePlan {
        PowerCyclePlan {
            off_settle: Duration::from_millis(off_ms),
            on_settle: Duration::from_millis(on_ms),
        }
    }

    #[tokio::test]
    async fn test_off_precedes_on_by_settle_delay() {
        let log: Log = Arc::default();
        let mut sequencer = PowerSequencer::new(Box::new(RecordingRelay { log: log.clone() }));

        let started = std::time::Instant::now();
        let report = sequencer
            .cycle(&plan(80, 40), &CancellationToken::new())
            .await
            .unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "off");
        assert_eq!(events[1].0, "on");
        assert!(events[1].1 - events[0].1 >= Duration::from_millis(80));
        assert!(report.off_duration_sec >= 0.08);
        // On-settle is honored before returning.
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_cancel_during_off_settle_skips_power_on() {
        let log: Log = Arc::default();
        let mut sequencer = PowerSequencer::new(Box::new(RecordingRelay { log: log.clone() }));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = sequencer.cycle(&plan(5_000, 10), &cancel).await.unwrap_err();
        assert!(matches!(err, PowerError::Cancelled));
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "off");
    }

    #[tokio::test]
    async fn test_command_relay_runs_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("relay.txt");
        let off = format!("echo off >> {}", marker.display());
        let on = format!("echo on >> {}", marker.display());
        let relay = CommandRelay::new("sh", vec![off], vec![on]);
        let mut sequencer = PowerSequencer::new(Box::new(relay));

        sequencer
            .cycle(&plan(1, 1), &CancellationToken::new())
            .await
            .unwrap();

        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content, "off\non\n");
    }

    #[tokio::test]
    async fn test_failing_relay_command_is_fatal() {
        let mut relay = CommandRelay::new(
            "sh",
            vec!["true".into(), "exit 3".into()],
            vec!["true".into()],
        );
        let err = relay.power_off().await.unwrap_err();
        assert!(matches!(err, PowerError::CommandFailed { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_missing_relay_tool_is_fatal() {
        let mut relay = CommandRelay::new("sh", vec!["nonexistent-relay-tool-xyz 8 1 0".into()], vec![]);
        let err = relay.power_off().await.unwrap_err();
        assert!(matches!(err, PowerError::CommandFailed { code: Some(127), .. }));

        let mut relay = CommandRelay::new("/nonexistent/shell", vec!["true".into()], vec![]);
        let err = relay.power_off().await.unwrap_err();
        assert!(matches!(err, PowerError::Spawn { .. }));
    }
}
