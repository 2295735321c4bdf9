//! Durable per-artifact build state.
//!
//! One JSON record per resource ID at `<state_dir>/<vmid>.json`. A record is
//! written only after a full successful pipeline run and always atomically, so
//! a crash mid-write leaves the previous record in place.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::fs::{remove_file_if_exists, write_atomic};

/// What the gate compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub source_mtime: u64,
    pub signature: String,
    /// Informational only; never compared
    #[serde(default)]
    pub built_at: Option<u64>,
}

impl StateRecord {
    pub fn new(source_mtime: u64, signature: impl Into<String>) -> Self {
        StateRecord {
            source_mtime,
            signature: signature.into(),
            built_at: None,
        }
    }

    /// Whether this record describes the given inputs.
    pub fn matches(&self, source_mtime: Option<u64>, signature: &str) -> bool {
        source_mtime == Some(self.source_mtime) && self.signature == signature
    }
}

/// State records on disk, keyed by resource ID.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, vmid: u32) -> PathBuf {
        self.dir.join(format!("{}.json", vmid))
    }

    /// Read the record for `vmid`.
    ///
    /// Missing and malformed records both read as `None`; a malformed one is
    /// logged and will be replaced by the next successful build.
    pub fn read(&self, vmid: u32) -> Option<StateRecord> {
        let path = self.record_path(vmid);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("cannot read state record {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("ignoring malformed state record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Atomically replace the record for `vmid`.
    pub fn write(&self, vmid: u32, source_mtime: u64, signature: &str) -> Result<StateRecord> {
        let record = StateRecord {
            built_at: Some(unix_now()),
            ..StateRecord::new(source_mtime, signature)
        };
        let content =
            serde_json::to_string_pretty(&record).context("failed to serialize state record")?;

        let path = self.record_path(vmid);
        write_atomic(&path, content.as_bytes())
            .with_context(|| format!("failed to write state for {}", vmid))?;
        tracing::debug!("wrote state record {}", path.display());
        Ok(record)
    }

    /// Forget `vmid`, forcing its next build. Returns whether a record existed.
    pub fn remove(&self, vmid: u32) -> Result<bool> {
        let path = self.record_path(vmid);
        let existed = path.exists();
        remove_file_if_exists(&path)?;
        Ok(existed)
    }

    /// All readable records, ordered by resource ID.
    pub fn list(&self) -> Result<Vec<(u32, StateRecord)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read state directory {}", self.dir.display()))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(vmid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(record) = self.read(vmid) {
                records.push((vmid, record));
            }
        }

        records.sort_by_key(|(vmid, _)| *vmid);
        Ok(records)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
