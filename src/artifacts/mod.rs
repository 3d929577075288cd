//! Per-run result directories.
//!
//! Each plateau's result files are moved into
//! `<destination_root>/run<NNN>_setpoint<value>_<YYYYmmdd_HHMMSS>/` together
//! with a `run.json` manifest. The run index keeps names unique even when
//! two runs share a timestamp second; an existing directory is an error,
//! never a merge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ResultsConfig;

pub const MANIFEST_FILE: &str = "run.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact directory {0} already exists")]
    Collision(PathBuf),

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write run manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> ArtifactError + 'a {
    move |source| ArtifactError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Record of one collected run. Written once as `run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunArtifact {
    pub run_index: u32,
    pub setpoint: f64,
    pub timestamp: DateTime<Local>,
    pub directory: PathBuf,
    /// File names moved into `directory`.
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    source_dir: PathBuf,
    destination_root: PathBuf,
    extensions: Vec<String>,
}

impl ArtifactCollector {
    pub fn new(source_dir: impl Into<PathBuf>, destination_root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            source_dir: source_dir.into(),
            destination_root: destination_root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &ResultsConfig) -> Self {
        Self::new(
            config.source_dir.clone(),
            config.destination_root.clone(),
            config.extensions.clone(),
        )
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    /// Deterministic directory name for a run. The setpoint is written in
    /// its shortest exact form, so distinct setpoints never share a name.
    pub fn directory_name(run_index: u32, setpoint: f64, timestamp: &DateTime<Local>) -> String {
        format!(
            "run{:03}_setpoint{}_{}",
            run_index,
            setpoint,
            timestamp.format("%Y%m%d_%H%M%S")
        )
    }

    /// One past the highest `runNNN_` index already under the destination
    /// root, or 1 if there is none.
    pub fn next_run_index(&self) -> Result<u32, ArtifactError> {
        let entries = match fs::read_dir(&self.destination_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(io_err("list", &self.destination_root)(e)),
        };

        let highest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_run_index(&entry.file_name().to_string_lossy()))
            .max()
            .unwrap_or(0);
        Ok(highest + 1)
    }

    /// Create the run directory and move every matching result file into it.
    pub fn collect(
        &self,
        run_index: u32,
        setpoint: f64,
        timestamp: DateTime<Local>,
    ) -> Result<RunArtifact, ArtifactError> {
        fs::create_dir_all(&self.destination_root)
            .map_err(io_err("create", &self.destination_root))?;

        let directory = self
            .destination_root
            .join(Self::directory_name(run_index, setpoint, &timestamp));
        match fs::create_dir(&directory) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ArtifactError::Collision(directory));
            }
            Err(e) => return Err(io_err("create", &directory)(e)),
        }

        let mut files = Vec::new();
        for path in self.result_files()? {
            let Some(name) = path.file_name() else { continue };
            let target = directory.join(name);
            relocate(&path, &target)?;
            debug!(file = %target.display(), "result file collected");
            files.push(name.to_string_lossy().into_owned());
        }
        files.sort();

        let artifact = RunArtifact {
            run_index,
            setpoint,
            timestamp,
            directory: directory.clone(),
            files,
        };

        let manifest = directory.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&artifact)?;
        fs::write(&manifest, json).map_err(io_err("write", &manifest))?;

        info!(
            run_index,
            setpoint,
            directory = %directory.display(),
            files = artifact.files.len(),
            "run artifacts collected"
        );
        Ok(artifact)
    }

    fn result_files(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let entries = fs::read_dir(&self.source_dir).map_err(io_err("list", &self.source_dir))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.matches(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

fn parse_run_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("run")?;
    let (digits, _) = rest.split_once('_')?;
    digits.parse().ok()
}

/// Rename, falling back to copy + remove across filesystems.
fn relocate(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(io_err("copy", from))?;
    fs::remove_file(from).map_err(io_err("remove", from))?;
    Ok(())
}
