use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Connection coordinates of the primary. The account is expected to be a
/// read-only replication user; preflight enforces that.
#[derive(Debug, Clone, Deserialize)]
pub struct PrimarySettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl PrimarySettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Immutable per-run settings, loaded once by the shell and handed to the
/// engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub primary: PrimarySettings,
    pub db_name: String,
    #[serde(default)]
    pub snapshot_tables: Vec<String>,
    #[serde(default)]
    pub stream_tables: Vec<String>,
    pub snapshot_workers: usize,
    pub snapshot_batch: u64,
    pub checkpoint_path: PathBuf,
    pub health_socket_path: PathBuf,
    pub sink_module: String,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let file = File::open(path)
            .map_err(|e| EngineError::Config(format!("cannot open {}: {e}", path.display())))?;
        let settings: Settings = serde_yaml::from_reader(file)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_name.is_empty() {
            return Err(EngineError::Config("db_name is empty".into()));
        }
        if self.snapshot_workers < 1 {
            return Err(EngineError::Config("snapshot_workers must be >= 1".into()));
        }
        if self.snapshot_batch < 1 {
            return Err(EngineError::Config("snapshot_batch must be >= 1".into()));
        }
        if self.sink_module.is_empty() {
            return Err(EngineError::Config("sink_module is empty".into()));
        }
        Ok(())
    }
}
