//! Snapshot persisted before the agent reboots the device or restarts itself.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::result::UpdateResult;

/// Phase the process ended in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotPhase {
    /// Every step installed; the outcome is known once the installed check runs.
    #[default]
    Apply,
    /// A step asked for an immediate restart; later steps and apply are still pending.
    Install,
}

/// State needed to report the outcome of a workflow after the process ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    #[serde(default)]
    pub phase: SnapshotPhase,
    pub work_folder: PathBuf,
    pub workflow_id: String,
    pub update_type: String,
    pub installed_criteria: Option<String>,
    /// Reported as `installedUpdateId` only if the installed check confirms it.
    #[serde(default)]
    pub installed_update_id: Option<String>,
    /// Step results when the restart came from an install step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<UpdateResult>,
    /// The document to send after restart, before its result is patched.
    pub reporting_json: String,
}

/// Durable storage for at most one [`PersistedSnapshot`].
pub trait SnapshotStore {
    /// Returns `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<PersistedSnapshot>>;
    /// Must be durable when it returns `Ok`.
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Pretty JSON file at a fixed path.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no snapshot");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read snapshot {}", self.path.display()))?;
        let snapshot: PersistedSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse snapshot {}", self.path.display()))?;
        debug!(workflow_id = %snapshot.workflow_id, "snapshot loaded");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        debug!(path = %self.path.display(), workflow_id = %snapshot.workflow_id, "writing snapshot");
        let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to remove snapshot");
                Err(err).with_context(|| format!("remove snapshot {}", self.path.display()))
            }
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp snapshot {}", tmp_path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write temp snapshot {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp snapshot {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace snapshot {}", path.display()))?;
    Ok(())
}
