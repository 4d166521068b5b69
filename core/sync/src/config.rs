//! Sync service configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use larder_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync service.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of ops sent in one batch.
    pub batch_size: usize,
    /// Quiet period after the last edit of a record before it is sent.
    pub debounce_window_ms: u64,
    /// Upper bound on how long a record's edits may be held back.
    pub max_debounce_ms: u64,
    /// First backoff delay after a transport failure.
    pub backoff_initial_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive backoff delays.
    pub backoff_multiplier: f64,
    /// Randomize backoff delays by +/- 25%.
    pub backoff_jitter: bool,
    /// Periodic reachability probe; 0 disables it.
    pub probe_interval_ms: u64,
    /// Window in which link-up signals collapse into a single probe.
    pub signal_debounce_ms: u64,
    /// Periodic drain trigger; 0 disables it.
    pub periodic_sync_ms: u64,
    /// Retries for a refresh fetch that fails in transit.
    pub refresh_retries: u32,
    /// Tick of the background debounce flush.
    pub flush_tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            debounce_window_ms: 400,
            max_debounce_ms: 2_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            backoff_jitter: true,
            probe_interval_ms: 30_000,
            signal_debounce_ms: 500,
            periodic_sync_ms: 60_000,
            refresh_retries: 3,
            flush_tick_ms: 100,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::InvalidInput(format!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidInput(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.max_debounce_ms < self.debounce_window_ms {
            return Err(Error::InvalidInput(format!(
                "max_debounce_ms ({}) is shorter than debounce_window_ms ({})",
                self.max_debounce_ms, self.debounce_window_ms
            )));
        }
        if self.flush_tick_ms == 0 {
            return Err(Error::InvalidInput("flush_tick_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Backoff schedule for the drain loop and the refresh retries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.refresh_retries)
            .with_initial_delay(Duration::from_millis(self.backoff_initial_ms))
            .with_max_delay(Duration::from_millis(self.backoff_max_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.backoff_jitter)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn max_debounce(&self) -> Duration {
        Duration::from_millis(self.max_debounce_ms)
    }

    pub fn signal_debounce(&self) -> Duration {
        Duration::from_millis(self.signal_debounce_ms)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_ms > 0).then(|| Duration::from_millis(self.probe_interval_ms))
    }

    pub fn periodic_sync(&self) -> Option<Duration> {
        (self.periodic_sync_ms > 0).then(|| Duration::from_millis(self.periodic_sync_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            backoff_initial_ms: 10_000,
            backoff_max_ms: 1_000,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            backoff_multiplier: 0.5,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            debounce_window_ms: 5_000,
            max_debounce_ms: 1_000,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"batch_size": 5, "periodic_sync_ms": 0}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.periodic_sync(), None);
        assert_eq!(config.debounce_window(), Duration::from_millis(400));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.json");
        std::fs::write(&path, r#"{"debounce_window_ms": 0, "probe_interval_ms": 0}"#).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.debounce_window(), Duration::ZERO);
        assert_eq!(config.probe_interval(), None);

        std::fs::write(&path, r#"{"batch_size": 0}"#).unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }

    #[test]
    fn test_retry_config_mapping() {
        let config = SyncConfig {
            backoff_initial_ms: 100,
            backoff_jitter: false,
            ..SyncConfig::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.max_retries, 3);
    }
}
