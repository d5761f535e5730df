//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of edits per upload request.
    pub batch_size: usize,
    /// Number of upload batches dispatched concurrently.
    pub parallelism: usize,
    /// Backoff policy for retriable edit failures.
    pub retry: RetryConfig,
    /// Whether the upload phase waits for edits in backoff within the same session.
    pub wait_for_retries: bool,
    /// Age after which an IN_FLIGHT edit found at sync start is demoted to PENDING.
    pub in_flight_timeout: Duration,
    /// Number of download attempts per sync for retriable failures.
    pub download_attempts: u32,
    /// Progress events buffered per subscriber.
    pub progress_capacity: usize,
    /// Sync mode.
    pub sync_mode: SyncMode,
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_wait_for_retries(mut self, wait: bool) -> Self {
        self.wait_for_retries = wait;
        self
    }

    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }

    pub fn with_download_attempts(mut self, attempts: u32) -> Self {
        self.download_attempts = attempts;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Edits selected per upload round.
    pub fn round_size(&self) -> usize {
        self.batch_size.max(1) * self.parallelism.max(1)
    }

    /// Retry policy for the download phase.
    pub fn download_retry(&self) -> RetryConfig {
        self.retry
            .clone()
            .with_max_retries(self.download_attempts.saturating_sub(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            parallelism: 1,
            retry: RetryConfig::default(),
            wait_for_retries: true,
            in_flight_timeout: Duration::from_secs(300),
            download_attempts: 3,
            progress_capacity: 64,
            sync_mode: SyncMode::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.in_flight_timeout, Duration::from_secs(300));
        assert_eq!(config.download_retry().max_retries, 2);
    }

    #[test]
    fn test_round_size_never_zero() {
        let config = SyncConfig::default().with_batch_size(0).with_parallelism(0);
        assert_eq!(config.round_size(), 1);
        assert_eq!(SyncConfig::default().with_parallelism(3).round_size(), 75);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"batch_size": 5}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.download_attempts, 3);
    }

    #[test]
    fn test_periodic_mode_round_trips() {
        let config = SyncConfig::default().with_sync_mode(SyncMode::Periodic {
            interval: Duration::from_secs(60),
        });
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
