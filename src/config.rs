//! Configuration for the synchronizer.
//!
//! Configuration is passed to [`Synchronizer::new()`](crate::Synchronizer::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_sync::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     source_uri: "mongodb://src:27017".into(),
//!     destination_uri: "mongodb://dst:27017".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── source_uri: String             # Where documents and the change log come from
//! ├── destination_uri: String        # Where they are written
//! ├── oplog_only: bool               # Skip the bulk copy
//! ├── settings: SyncSettings
//! │   ├── connect: ConnectConfig     # Startup connectivity check
//! │   ├── copy: CopyConfig           # Parallel bulk copy
//! │   └── tail: TailConfig           # Change-log replication
//! └── checkpoint: CheckpointConfig   # SQLite checkpoint persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! source_uri: "mongodb://rs0.example.com:27017"
//! destination_uri: "mongodb://backup.example.com:27017"
//!
//! settings:
//!   copy:
//!     workers: 8
//!     queue_capacity: 10000
//!   tail:
//!     batch_size: 500
//!     reconnect_max_delay: "2m"
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/oplog-sync/checkpoints.db"
//!   flush_interval: "5s"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Synchronizer::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Source address. Also keys the stored checkpoint.
    pub source_uri: String,

    /// Destination address (for logging).
    pub destination_uri: String,

    /// Skip the bulk copy and only replicate the change log.
    /// The destination is assumed to be seeded already.
    #[serde(default)]
    pub oplog_only: bool,

    #[serde(default)]
    pub settings: SyncSettings,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_uri: "mongodb://localhost:27017".to_string(),
            destination_uri: "mongodb://localhost:27018".to_string(),
            oplog_only: false,
            settings: SyncSettings::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a config with fast timeouts for testing.
    pub fn for_testing(source_uri: &str, destination_uri: &str, sqlite_path: &str) -> Self {
        Self {
            source_uri: source_uri.to_string(),
            destination_uri: destination_uri.to_string(),
            oplog_only: false,
            settings: SyncSettings {
                connect: ConnectConfig {
                    timeout: "500ms".to_string(),
                    max_attempts: 2,
                },
                copy: CopyConfig {
                    workers: Some(4),
                    queue_capacity: 256,
                    ..Default::default()
                },
                tail: TailConfig {
                    batch_size: 100,
                    reconnect_initial_delay: "10ms".to_string(),
                    reconnect_max_delay: "100ms".to_string(),
                },
            },
            checkpoint: CheckpointConfig {
                sqlite_path: sqlite_path.to_string(),
                flush_interval: "50ms".to_string(),
                resume: true,
            },
        }
    }

    /// Key of the stored checkpoint for this source and destination pair.
    ///
    /// A checkpoint only means something for the destination it was written
    /// into, so pointing the same source at another destination starts fresh.
    pub fn checkpoint_key(&self) -> String {
        format!("{}->{}", self.source_uri, self.destination_uri)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.source_uri.trim().is_empty() {
            return Err(ReplicationError::Config("source_uri is empty".into()));
        }
        if self.destination_uri.trim().is_empty() {
            return Err(ReplicationError::Config("destination_uri is empty".into()));
        }
        if self.settings.copy.workers == Some(0) {
            return Err(ReplicationError::Config("copy.workers must be at least 1".into()));
        }
        if self.settings.copy.queue_capacity == 0 {
            return Err(ReplicationError::Config("copy.queue_capacity must be at least 1".into()));
        }
        if self.settings.copy.progress_interval == 0 {
            return Err(ReplicationError::Config("copy.progress_interval must be at least 1".into()));
        }
        if self.settings.tail.batch_size == 0 {
            return Err(ReplicationError::Config("tail.batch_size must be at least 1".into()));
        }
        for (name, value) in [
            ("connect.timeout", &self.settings.connect.timeout),
            ("tail.reconnect_initial_delay", &self.settings.tail.reconnect_initial_delay),
            ("tail.reconnect_max_delay", &self.settings.tail.reconnect_max_delay),
            ("checkpoint.flush_interval", &self.checkpoint.flush_interval),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("{} '{}' is not a duration: {}", name, value, e))
            })?;
        }
        Ok(())
    }
}

/// Tunable parameters for each phase.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncSettings {
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub tail: TailConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectConfig: startup connectivity check
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Dial timeout per attempt as a duration string (e.g., "3s").
    #[serde(default = "default_connect_timeout")]
    pub timeout: String,

    /// Attempts before startup gives up.
    #[serde(default = "default_connect_attempts")]
    pub max_attempts: usize,
}

fn default_connect_timeout() -> String {
    "3s".to_string()
}

fn default_connect_attempts() -> usize {
    3
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: default_connect_timeout(),
            max_attempts: default_connect_attempts(),
        }
    }
}

impl ConnectConfig {
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(3))
    }

    /// Startup retry policy with this timeout and attempt budget.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            connection_timeout: self.timeout_duration(),
            ..RetryConfig::startup()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CopyConfig: parallel bulk copy
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Insert workers per collection. `None` uses the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Documents buffered between the cursor reader and the workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Log progress every this many documents.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Bound destination write rate during the copy.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained writes per second when rate limited.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when rate limited.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_progress_interval() -> u64 {
    10_000
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_capacity: default_queue_capacity(),
            progress_interval: default_progress_interval(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl CopyConfig {
    /// Number of insert workers.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
        .max(1)
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailConfig: change-log replication
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// Maximum entries requested per read.
    #[serde(default = "default_tail_batch_size")]
    pub batch_size: usize,

    /// First reconnect delay after the tail drops (e.g., "1s").
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: String,

    /// Ceiling for reconnect backoff (e.g., "5m").
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: String,
}

fn default_tail_batch_size() -> usize {
    500
}

fn default_reconnect_initial_delay() -> String {
    "1s".to_string()
}

fn default_reconnect_max_delay() -> String {
    "5m".to_string()
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            batch_size: default_tail_batch_size(),
            reconnect_initial_delay: default_reconnect_initial_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
        }
    }
}

impl TailConfig {
    /// Retry forever with exponential backoff between the configured bounds.
    pub fn reconnect_retry(&self) -> RetryConfig {
        let daemon = RetryConfig::daemon();
        RetryConfig {
            initial_delay: humantime::parse_duration(&self.reconnect_initial_delay)
                .unwrap_or(daemon.initial_delay),
            max_delay: humantime::parse_duration(&self.reconnect_max_delay)
                .unwrap_or(daemon.max_delay),
            ..daemon
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// How often recorded checkpoints are written to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,

    /// Resume from a stored checkpoint instead of running a fresh sync.
    #[serde(default = "default_true")]
    pub resume: bool,
}

fn default_sqlite_path() -> String {
    "oplog_sync_checkpoints.db".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            flush_interval: default_flush_interval(),
            resume: true,
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing. Nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            flush_interval: default_flush_interval(),
            resume: false,
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.oplog_only);
        assert!(config.checkpoint.resume);
    }

    #[test]
    fn test_copy_defaults() {
        let config = CopyConfig::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.progress_interval, 10_000);
        assert!(config.workers.is_none());
        assert!(config.worker_count() >= 1);
        assert!(config.rate_limit_config().is_none());
    }

    #[test]
    fn test_copy_explicit_workers() {
        let config = CopyConfig {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_copy_rate_limit_config() {
        let mut config = CopyConfig::default();
        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 5000;
        config.rate_limit_burst = 500;

        let rate_config = config.rate_limit_config().unwrap();
        assert_eq!(rate_config.refill_rate, 5000);
        assert_eq!(rate_config.burst_size, 500);
    }

    #[test]
    fn test_connect_retry_config() {
        let config = ConnectConfig::default();
        let retry = config.retry_config();
        assert_eq!(retry.connection_timeout, Duration::from_secs(3));
        assert_eq!(retry.max_attempts, 3);
    }

    #[test]
    fn test_tail_reconnect_retry() {
        let config = TailConfig {
            batch_size: 10,
            reconnect_initial_delay: "250ms".to_string(),
            reconnect_max_delay: "2m".to_string(),
        };
        let retry = config.reconnect_retry();
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(120));
        assert_eq!(retry.max_attempts, usize::MAX);
    }

    #[test]
    fn test_tail_reconnect_invalid_fallback() {
        let config = TailConfig {
            reconnect_initial_delay: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.reconnect_retry().initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_duration_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = CheckpointConfig {
                flush_interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.flush_interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.source_uri = " ".into();
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));

        let mut config = SyncConfig::default();
        config.settings.copy.workers = Some(0);
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.settings.tail.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.checkpoint.flush_interval = "often".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("checkpoint.flush_interval"));
    }

    #[test]
    fn test_checkpoint_in_memory() {
        let config = CheckpointConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.resume);
    }

    #[test]
    fn test_for_testing_config() {
        let config = SyncConfig::for_testing("mem://src", "mem://dst", "/tmp/x.db");
        assert!(config.validate().is_ok());
        assert_eq!(config.settings.copy.worker_count(), 4);
        assert_eq!(config.checkpoint.flush_interval_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_checkpoint_key_includes_destination() {
        let a = SyncConfig::for_testing("mem://src", "mem://dest-a", ":memory:");
        let b = SyncConfig::for_testing("mem://src", "mem://dest-b", ":memory:");
        assert_eq!(a.checkpoint_key(), "mem://src->mem://dest-a");
        assert_ne!(a.checkpoint_key(), b.checkpoint_key());
    }

    #[test]
    fn test_config_json_minimal() {
        let json = r#"{"source_uri": "mongodb://a", "destination_uri": "mongodb://b"}"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.source_uri, "mongodb://a");
        assert_eq!(config.settings.copy.queue_capacity, 10_000);
        assert_eq!(config.settings.tail.batch_size, 500);
        assert_eq!(config.checkpoint.flush_interval, "5s");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = SyncConfig::default();
        config.oplog_only = true;
        config.settings.copy.workers = Some(6);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();

        assert!(parsed.oplog_only);
        assert_eq!(parsed.settings.copy.workers, Some(6));
        assert_eq!(parsed.destination_uri, config.destination_uri);
    }
}
