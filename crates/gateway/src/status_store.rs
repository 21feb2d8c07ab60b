//! Bounded history of dispatch outcomes, persisted as one JSON array.
//!
//! The file is newest-first and never longer than [`HISTORY_LIMIT`].
//! Missing or corrupt storage reads as an empty history.
//!
//! `record` is a read-modify-write of the whole document with no locking.
//! Two dispatches finishing at the same moment can each read the old
//! history and the later rename wins, dropping the other entry. This is a
//! known limitation; closing it needs either a file lock or an in-memory
//! authoritative copy.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use codelexa_common::fs::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const HISTORY_LIMIT: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub task: String,
    pub status: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub intent: String,
}

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepend `entry`, keep the newest [`HISTORY_LIMIT`], write back atomically.
    pub fn record(&self, entry: StatusEntry) -> Result<()> {
        let mut history = self.entries();
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);

        let document =
            serde_json::to_vec_pretty(&history).context("failed to serialize status history")?;
        write_atomic(&self.path, &document)
            .with_context(|| format!("failed to persist status history to {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            entries = history.len(),
            "status history updated"
        );
        Ok(())
    }

    pub fn latest(&self) -> Option<StatusEntry> {
        self.entries().into_iter().next()
    }

    /// Full history, newest first.
    pub fn entries(&self) -> Vec<StatusEntry> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "status history unreadable; treating as empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<StatusEntry>>(&raw) {
            Ok(history) => history,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "status history corrupt; treating as empty");
                Vec::new()
            }
        }
    }
}
