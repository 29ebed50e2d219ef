//! Pipeline configuration
//!
//! Loaded from TOML; every section and field has a default so a partial file
//! (or none at all) is valid.

use cairn_core::{CairnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    /// Durable queue and retry behaviour
    pub queue: QueueConfig,
    /// Anchor commit cadence
    pub anchor: AnchorConfig,
    /// Verification fetch concurrency
    pub verification: VerificationConfig,
    /// Local persistence
    pub storage: StorageConfig,
}

/// Durable queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent task executions
    pub worker_count: usize,
    /// Attempts before a task goes terminal
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub base_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Randomize retry delays
    pub jitter: bool,
    /// Per-attempt timeout in milliseconds
    pub attempt_timeout_ms: u64,
}

impl QueueConfig {
    /// Per-attempt timeout
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_attempts: 8,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter: true,
            attempt_timeout_ms: 5_000,
        }
    }
}

/// When anchor tasks reach the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPolicy {
    /// Commit once per chunk, skipping only commits already covered
    #[default]
    EveryChunk,
    /// Additionally skip a commit when a newer one for the session is queued
    LatestOnly,
}

/// Anchor configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Commit cadence
    pub policy: AnchorPolicy,
}

/// Verification configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Chunks fetched and checked at once
    pub max_concurrent_fetches: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the filesystem durable store
    pub base_path: PathBuf,
    /// Keep settled sessions when a new one starts
    pub retain_previous_sessions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".cairn"),
            retain_previous_sessions: false,
        }
    }
}

impl CairnConfig {
    /// Parse TOML and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CairnError::invalid(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CairnError::invalid(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Millisecond backoff and short timeouts for tests
    pub fn for_testing() -> Self {
        Self {
            queue: QueueConfig {
                worker_count: 2,
                max_attempts: 5,
                base_backoff_ms: 5,
                max_backoff_ms: 50,
                jitter: false,
                attempt_timeout_ms: 1_000,
            },
            anchor: AnchorConfig::default(),
            verification: VerificationConfig::default(),
            storage: StorageConfig {
                base_path: std::env::temp_dir().join("cairn-test"),
                retain_previous_sessions: false,
            },
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.queue.worker_count == 0 {
            return Err(CairnError::invalid("queue.worker_count must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(CairnError::invalid("queue.max_attempts must be at least 1"));
        }
        if self.queue.base_backoff_ms > self.queue.max_backoff_ms {
            return Err(CairnError::invalid(
                "queue.base_backoff_ms must not exceed queue.max_backoff_ms",
            ));
        }
        if self.queue.attempt_timeout_ms == 0 {
            return Err(CairnError::invalid(
                "queue.attempt_timeout_ms must be positive",
            ));
        }
        if self.verification.max_concurrent_fetches == 0 {
            return Err(CairnError::invalid(
                "verification.max_concurrent_fetches must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CairnConfig::default();
        assert_eq!(config.queue.worker_count, 2);
        assert_eq!(config.queue.max_attempts, 8);
        assert_eq!(config.queue.base_backoff_ms, 1_000);
        assert_eq!(config.queue.max_backoff_ms, 60_000);
        assert!(config.queue.jitter);
        assert_eq!(config.anchor.policy, AnchorPolicy::EveryChunk);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = CairnConfig::from_toml_str(
            r#"
            [queue]
            worker_count = 4

            [anchor]
            policy = "latest_only"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.worker_count, 4);
        assert_eq!(config.queue.max_attempts, 8);
        assert_eq!(config.anchor.policy, AnchorPolicy::LatestOnly);
        assert_eq!(config.verification.max_concurrent_fetches, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = CairnConfig::from_toml_str(
            r#"
            [queue]
            base_backoff_ms = 5000
            max_backoff_ms = 100
            "#,
        );
        assert!(matches!(result, Err(CairnError::Invalid { .. })));
        assert!(CairnConfig::from_toml_str("[queue]\nworker_count = 0").is_err());
        assert!(CairnConfig::from_toml_str("not = [valid").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cairn.toml");
        std::fs::write(&path, "[storage]\nretain_previous_sessions = true\n").unwrap();
        let config = CairnConfig::load(&path).unwrap();
        assert!(config.storage.retain_previous_sessions);
        assert!(CairnConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_testing_config_is_valid() {
        assert!(CairnConfig::for_testing().validate().is_ok());
    }
}
