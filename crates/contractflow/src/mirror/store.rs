//! JSON file persistence for the client mirror.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::JobSnapshot;

use super::MirrorError;

/// One job as the client last saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredJob {
    pub snapshot: JobSnapshot,
    /// When the client first observed a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_since: Option<DateTime<Utc>>,
}

/// Everything the mirror keeps across reloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorState {
    #[serde(default)]
    pub jobs: BTreeMap<String, MirroredJob>,
    #[serde(default)]
    pub minimized: BTreeSet<String>,
}

/// Reads and writes [`MirrorState`] as a JSON file.
#[derive(Debug, Clone)]
pub struct MirrorFile {
    path: PathBuf,
}

impl MirrorFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty state.
    pub fn load(&self) -> Result<MirrorState, MirrorError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MirrorState::default()),
            Err(e) => {
                return Err(MirrorError::ReadFile {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes beside the target and renames, so a crash mid-write leaves the
    /// previous state intact.
    pub fn save(&self, state: &MirrorState) -> Result<(), MirrorError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| MirrorError::WriteFile {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        write(&tmp).map_err(|e| MirrorError::WriteFile {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| MirrorError::WriteFile {
            path: self.path.clone(),
            source: e,
        })
    }
}
