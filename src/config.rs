//! Node configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::DEFAULT_CHANGELOG_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of this schedule node, stamped into mirror updates and query
    /// announcements so subscribers can detect a fail-over.
    pub node_version: u64,
    /// Liveliness lease period for the redundancy heartbeat.
    pub heartbeat_period_ms: u64,
    /// Cadence of the mirror update tick.
    pub mirror_update_period_ms: u64,
    /// Cadence of the idle-query sweep.
    pub query_cleanup_period_ms: u64,
    /// How long a query may sit without subscribers before it is dropped.
    pub query_grace_period_ms: u64,
    /// Retained change-log entries before patches fall back to snapshots.
    pub changelog_capacity: usize,
    /// Persistent participant registry location.
    pub registry_path: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_version: 0,
            heartbeat_period_ms: 1_000,
            mirror_update_period_ms: 10,
            query_cleanup_period_ms: 600_000,
            query_grace_period_ms: 300_000,
            changelog_capacity: DEFAULT_CHANGELOG_CAPACITY,
            registry_path: PathBuf::from(".schedule_node.json"),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn mirror_update_period(&self) -> Duration {
        Duration::from_millis(self.mirror_update_period_ms)
    }

    pub fn query_cleanup_period(&self) -> Duration {
        Duration::from_millis(self.query_cleanup_period_ms)
    }

    pub fn query_grace_period(&self) -> Duration {
        Duration::from_millis(self.query_grace_period_ms)
    }

    /// Load from a TOML file; absent file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stderr: bool,
    /// Tracing filter directive, e.g. `info` or `junction=debug`.
    pub filter: Option<String>,
    /// Optional log file appended alongside stderr output.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stderr: true,
            filter: None,
            file: None,
        }
    }
}
