//! Scheduling configuration
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! configuration file (TOML, YAML or JSON, picked by extension) and
//! `MAPFLOW_*` environment variables such as `MAPFLOW_WORKER_COUNT=4`.

use crate::error::{MapflowError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "MAPFLOW";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between evaluation cycles
    pub poll_interval_secs: u64,
    /// Task queue capacity
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Directory step commands are resolved against and run in
    pub working_directory: PathBuf,
    /// SQLite database path
    pub database: PathBuf,
    /// Program that receives the resolved command path, e.g. `python3`
    pub interpreter: Option<String>,
    pub step_timeout_secs: Option<u64>,
    /// Serve Prometheus metrics on 127.0.0.1 at this port
    pub metrics_port: Option<u16>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            queue_capacity: 20,
            worker_count: 1,
            working_directory: PathBuf::from("."),
            database: PathBuf::from("mapflow.db"),
            interpreter: None,
            step_timeout_secs: None,
            metrics_port: None,
        }
    }
}

impl SchedulerConfig {
    /// Load and validate configuration from `path` and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(prefix).try_parsing(true));

        let config: SchedulerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(MapflowError::Validation(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(MapflowError::Validation(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(MapflowError::Validation(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.step_timeout_secs == Some(0) {
            return Err(MapflowError::Validation(
                "step_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}
