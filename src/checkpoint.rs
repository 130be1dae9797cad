use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// A binlog position the consumer has fully processed: every transaction
/// committed at or before it has been delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub log_file: String,
    pub log_pos: u64,
}

impl Checkpoint {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Checkpoint {
        Checkpoint {
            log_file: log_file.into(),
            log_pos,
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Persists the checkpoint as a small JSON file. Writes go to a sibling
/// tmp file first and are renamed over the target, so a reader only ever
/// observes a complete prior or a complete new version.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> CheckpointStore {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted checkpoint, or `None` when the file is
    /// missing, unreadable, or does not hold both fields well-typed.
    /// Corrupt content is treated the same as absence: the caller falls
    /// back to a full snapshot.
    pub fn load(&self) -> Option<Checkpoint> {
        let raw = fs::read(&self.path).ok()?;
        match serde_json::from_slice::<Checkpoint>(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "discarding unreadable checkpoint");
                None
            }
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let tmp = self.tmp_path();
        fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(checkpoint = %checkpoint, "checkpoint saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}
