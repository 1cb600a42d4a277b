//! Engine configuration.
//!
//! Every section is optional in TOML; missing keys fall back to `Default`.
//!
//! ```toml
//! root_dir = "/var/lib/spool/jobs"
//!
//! [scheduler]
//! workers = 4
//! grace_period_ms = 5000
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one working directory per job.
    pub root_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("jobs"),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.scheduler.workers = workers;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.scheduler.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once.
    pub workers: usize,
    /// How long a cancelled task may take to wind down before it is force-aborted.
    pub grace_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            grace_period_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    /// Never less than one worker.
    pub fn worker_slots(&self) -> usize {
        self.workers.max(1)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
