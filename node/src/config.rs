// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::errors::{NodeError, NodeResult};
use eventsource_kernel::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATA_DIR: &str = "EVENTSOURCE_DATA_DIR";
pub const ENV_SEGMENT_MAX_BYTES: &str = "EVENTSOURCE_SEGMENT_MAX_BYTES";
pub const ENV_INDEX_INTERVAL_BYTES: &str = "EVENTSOURCE_INDEX_INTERVAL_BYTES";
pub const ENV_RETRY_BACKOFF_MS: &str = "EVENTSOURCE_RETRY_BACKOFF_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub log: LogConfig,
    /// Records read per delivery round.
    pub delivery_batch_size: usize,
    /// Wait between redeliveries of a Nacked record, and after a failed read.
    pub retry_backoff_ms: u64,
    /// Upper bound on how long an idle connector sleeps before re-checking the log.
    pub idle_poll_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/events"),
            log: LogConfig::default(),
            delivery_batch_size: 128,
            retry_backoff_ms: 200,
            idle_poll_interval_ms: 1000,
        }
    }
}

impl NodeConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&contents).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Defaults (or `path`, when given) with environment overrides applied.
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> NodeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup(ENV_SEGMENT_MAX_BYTES) {
            self.log.segment_max_bytes = parse_var(ENV_SEGMENT_MAX_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_INDEX_INTERVAL_BYTES) {
            self.log.index_interval_bytes = parse_var(ENV_INDEX_INTERVAL_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_BACKOFF_MS) {
            self.retry_backoff_ms = parse_var(ENV_RETRY_BACKOFF_MS, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.delivery_batch_size == 0 {
            return Err(NodeError::Config("delivery_batch_size must be positive".into()));
        }
        self.log.validate()?;
        Ok(())
    }
}

fn parse_var(name: &str, value: &str) -> NodeResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| NodeError::Config(format!("{} must be an unsigned integer, got {:?}", name, value)))
}
