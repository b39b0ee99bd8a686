//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Backoff parameters for the spectator subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Base delay, also the value restored after a successful snapshot.
    pub initial_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts allowed before the subscription fails for good.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Durable queue location.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// RocksDB directory for the pending slot.
    pub path: PathBuf,
    /// fsync every write. Off by default: the slot is overwritten often and
    /// RocksDB's own WAL already survives a process kill.
    pub sync_writes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./rally_queue"),
            sync_writes: false,
        }
    }
}

impl QueueConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reconnect: ReconnectConfig,
    /// Connectivity assumed at construction.
    pub start_online: bool,
    /// Start the spectator count mirror automatically after `host_match`.
    pub mirror_on_host: bool,
    /// Pause between a failed broadcast write and the next attempt.
    pub flush_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            start_online: true,
            mirror_on_host: true,
            flush_retry_delay: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Short delays so paused-clock tests advance quickly.
    pub fn for_testing() -> Self {
        Self {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                multiplier: 1.5,
                max_delay: Duration::from_millis(300),
                max_attempts: 10,
            },
            start_online: true,
            mirror_on_host: true,
            flush_retry_delay: Duration::from_millis(5),
        }
    }
}
