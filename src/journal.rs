//! Append-only JSON-lines journal of a harness session.
//!
//! One line per phase transition, tagged with the session id, so a long
//! unattended run can be reconstructed after the fact even if the console
//! output is lost.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    SessionStarted,
    SetpointCommanded,
    Stabilized,
    StabilizationTimedOut,
    DwellCompleted,
    WorkloadCompleted,
    PowerCycled,
    ArtifactsCollected,
    SessionFinished,
    SessionAborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub session_id: Uuid,
    pub event: JournalEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setpoint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u32>,
    /// "pass" / "fail" where a verdict applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl JournalEntry {
    pub fn new(session_id: Uuid, event: JournalEvent) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session_id,
            event,
            setpoint: None,
            run_index: None,
            verdict: None,
            detail: None,
        }
    }

    pub fn with_setpoint(mut self, setpoint: f64) -> Self {
        self.setpoint = Some(setpoint);
        self
    }

    pub fn with_run_index(mut self, run_index: u32) -> Self {
        self.run_index = Some(run_index);
        self
    }

    pub fn with_verdict(mut self, passed: bool) -> Self {
        self.verdict = Some(if passed { "pass" } else { "fail" }.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub struct Journal {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl Journal {
    /// Open (or create) the journal at `path` in append mode.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create journal directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open journal: {}", path.display()))?;

        debug!(path = %path.display(), "run journal opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub async fn record(&self, entry: JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("failed to serialize journal entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to journal: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush journal: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(path.clone()).await.unwrap();
        let session = Uuid::new_v4();

        journal
            .record(JournalEntry::new(session, JournalEvent::SessionStarted))
            .await
            .unwrap();
        journal
            .record(
                JournalEntry::new(session, JournalEvent::Stabilized)
                    .with_setpoint(30.0)
                    .with_detail(serde_json::json!({"value": 29.8, "polls": 3})),
            )
            .await
            .unwrap();
        journal
            .record(
                JournalEntry::new(session, JournalEvent::ArtifactsCollected)
                    .with_setpoint(30.0)
                    .with_run_index(1)
                    .with_verdict(false),
            )
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 3);

        let first: JournalEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, JournalEvent::SessionStarted);
        assert_eq!(first.session_id, session);

        let second: JournalEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.setpoint, Some(30.0));
        assert_eq!(second.detail.unwrap()["polls"], 3);

        let third: JournalEntry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(third.run_index, Some(1));
        assert_eq!(third.verdict.as_deref(), Some("fail"));
    }

    #[tokio::test]
    async fn test_creates_parent_dirs_and_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("results/nested/journal.jsonl");
        let session = Uuid::new_v4();

        {
            let journal = Journal::open(path.clone()).await.unwrap();
            journal
                .record(JournalEntry::new(session, JournalEvent::SessionStarted))
                .await
                .unwrap();
        }
        {
            let journal = Journal::open(path.clone()).await.unwrap();
            journal
                .record(JournalEntry::new(session, JournalEvent::SessionFinished).with_verdict(true))
                .await
                .unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_none_fields_omitted() {
        let entry = JournalEntry::new(Uuid::nil(), JournalEvent::DwellCompleted);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("\"setpoint\""));
        assert!(!json.contains("\"run_index\""));
        assert!(!json.contains("\"verdict\""));
        assert!(!json.contains("\"detail\""));
        assert!(json.contains("\"dwell_completed\""));
    }
}
