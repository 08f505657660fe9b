//! Engine configuration
//!
//! Every section has defaults, so a partial JSON document (or `{}`) is a
//! valid configuration.
//!
//! ```rust
//! use labmix_store::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{"retry": {"max_retries": 5}}"#).unwrap();
//! assert_eq!(config.retry.max_retries, 5);
//! assert_eq!(config.workers, 32);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Document write retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Store connection pools
    #[serde(default)]
    pub pools: PoolConfig,

    /// Idempotency dedup window
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Maximum concurrently executing operations
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Background reconciliation
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Aggregate view refresh
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Capacity of the alert channel
    #[serde(default = "default_alert_buffer")]
    pub alert_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            pools: PoolConfig::default(),
            dedup: DedupConfig::default(),
            workers: default_workers(),
            reconciler: ReconcilerConfig::default(),
            compaction: CompactionConfig::default(),
            alert_buffer: default_alert_buffer(),
        }
    }
}

const fn default_workers() -> usize {
    32
}

const fn default_alert_buffer() -> usize {
    256
}

/// Bounded exponential backoff for store calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Ceiling for any single delay
    pub max_delay_ms: u64,
    /// Deadline for one store call
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            call_timeout_ms: 5_000,
        }
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Structured store connections
    pub structured_connections: usize,
    /// Document store connections
    pub document_connections: usize,
    /// Wait limit for a free connection
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            structured_connections: 16,
            document_connections: 16,
            acquire_timeout_ms: 2_000,
        }
    }
}

/// Idempotency window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum remembered keys (oldest evicted first)
    pub capacity: usize,
    /// How long a key is remembered
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 86_400,
        }
    }
}

/// Reconciler schedule and escalation thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Time between scans
    pub interval_secs: u64,
    /// How far back each scan looks for recent writes
    pub scan_window_secs: u64,
    /// Failed repairs before a divergence is escalated
    pub repair_attempts_before_escalation: u32,
    /// Divergences older than this are escalated
    pub max_divergence_window_secs: u64,
    /// Scan reports kept for `consistency_report`
    pub history_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 180,
            scan_window_secs: 900,
            repair_attempts_before_escalation: 3,
            max_divergence_window_secs: 3_600,
            history_limit: 256,
        }
    }
}

/// Debounce for the aggregate view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Quiet period after the last change event
    pub debounce_ms: u64,
    /// Upper bound on how long a burst can postpone a refresh
    pub max_delay_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.workers == 0, "workers must be > 0"),
            (self.alert_buffer == 0, "alert_buffer must be > 0"),
            (self.pools.structured_connections == 0, "pools.structured_connections must be > 0"),
            (self.pools.document_connections == 0, "pools.document_connections must be > 0"),
            (self.retry.call_timeout_ms == 0, "retry.call_timeout_ms must be > 0"),
            (
                self.retry.base_delay_ms > self.retry.max_delay_ms,
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ),
            (self.dedup.capacity == 0, "dedup.capacity must be > 0"),
            (self.reconciler.interval_secs == 0, "reconciler.interval_secs must be > 0"),
            (
                self.reconciler.repair_attempts_before_escalation == 0,
                "reconciler.repair_attempts_before_escalation must be > 0",
            ),
            (
                self.compaction.debounce_ms > self.compaction.max_delay_ms,
                "compaction.debounce_ms must not exceed compaction.max_delay_ms",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

impl RetryConfig {
    /// Delay before the first retry
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Ceiling for any single delay
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Deadline for one store call
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl PoolConfig {
    /// Wait limit for a free connection
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl DedupConfig {
    /// How long a key is remembered
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ReconcilerConfig {
    /// Time between scans
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Look-back window per scan
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs)
    }

    /// Escalation age
    #[must_use]
    pub const fn max_divergence_window(&self) -> Duration {
        Duration::from_secs(self.max_divergence_window_secs)
    }
}

impl CompactionConfig {
    /// Quiet period
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Maximum postponement
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(1));
        assert_eq!(config.reconciler.interval(), Duration::from_secs(180));
        assert_eq!(config.workers, 32);
        assert_eq!(config.alert_buffer, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let config =
            EngineConfig::from_json_str(r#"{"pools": {"document_connections": 4}}"#).unwrap();
        assert_eq!(config.pools.document_connections, 4);
        assert_eq!(config.pools.structured_connections, 16);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let err = EngineConfig::from_json_str(r#"{"workers": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("workers")));
    }

    #[test]
    fn test_validation_rejects_inverted_delays() {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(Error::Json(_))
        ));
    }
}
