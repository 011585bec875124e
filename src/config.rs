use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::OverflowStrategy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts made by the retry executor for a single call.
    pub max_retries: u32,
    /// Fixed backoff schedule between attempts. The last entry repeats when
    /// `max_retries` exceeds the schedule length.
    pub retry_delays_ms: Vec<u64>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    /// Key under which the queue blob is persisted.
    pub queue_storage_key: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Probes slower than this downgrade quality to `slow`.
    pub slow_latency_threshold_ms: u64,
    /// Consecutive probe failures before an online monitor goes offline.
    pub offline_after_probe_failures: u32,
    /// Periodic drain trigger while online with a non-empty queue.
    pub drain_interval_ms: u64,
    pub max_queue_len: usize,
    pub overflow: OverflowStrategy,
    /// Total attempts after which a queued action is dropped for good.
    pub max_action_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delays_ms: vec![1_000, 3_000, 10_000],
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 100,
            queue_storage_key: "offline_queue".to_string(),
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            slow_latency_threshold_ms: 1_000,
            offline_after_probe_failures: 3,
            drain_interval_ms: 15_000,
            max_queue_len: 1_000,
            overflow: OverflowStrategy::RejectNew,
            max_action_attempts: 10,
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: SyncConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(ConfigError::Invalid("retry_delays_ms must not be empty".into()));
        }
        if self.rate_limit_window_ms == 0 || self.rate_limit_max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate limit window and ceiling must be non-zero".into(),
            ));
        }
        if self.queue_storage_key.is_empty() {
            return Err(ConfigError::Invalid("queue_storage_key must not be empty".into()));
        }
        if self.max_queue_len == 0 || self.max_action_attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue length and attempt ceilings must be non-zero".into(),
            ));
        }
        if self.probe_interval_ms == 0 || self.drain_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe and drain intervals must be non-zero".into(),
            ));
        }
        if self.offline_after_probe_failures == 0 {
            return Err(ConfigError::Invalid(
                "offline_after_probe_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}
