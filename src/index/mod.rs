//! Buffered, hour-bucketed indices of post appearances and references.
//!
//! Ingestion writes land in memory ([`BufferedIndex`]); a periodic flush
//! persists dirty buckets to the ephemeral store, where they expire after the
//! retention window. Idle clean buckets are evicted from memory.

pub mod bucket;
pub mod buffer;
pub mod posts;
pub mod references;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::{env_or, ConfigError};

pub use bucket::{local_hour, HourBucket};
pub use buffer::{BufferTiming, BufferedIndex, FlushReport};
pub use posts::{PostIndexBucket, PostIndexBuffer};
pub use references::{ReferenceBucket, ReferenceBuffer, ReferenceSource};

/// Flush, eviction and retention settings for the buffered indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Seconds between flushes of dirty buckets.
    pub flush_interval_secs: u64,
    /// Seconds a clean bucket may stay untouched before eviction.
    pub staleness_secs: u64,
    /// Seconds flushed buckets live in the ephemeral store.
    pub retention_secs: u64,
    /// Seconds between expiration sweeps of the ephemeral store.
    pub sweep_interval_secs: u64,
    /// Timeout for one bucket read, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Timeout for one bucket write, in milliseconds.
    pub write_timeout_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            staleness_secs: 600,
            // Ranking looks back two days plus an hour.
            retention_secs: 3 * 24 * 3600,
            sweep_interval_secs: 3600,
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: 10_000,
        }
    }
}

impl IndexConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `NEIGHBORHOOD_INDEX_FLUSH_INTERVAL_SECS`
    /// - `NEIGHBORHOOD_INDEX_STALENESS_SECS`
    /// - `NEIGHBORHOOD_INDEX_RETENTION_SECS`
    /// - `NEIGHBORHOOD_INDEX_SWEEP_INTERVAL_SECS`
    /// - `NEIGHBORHOOD_INDEX_READ_TIMEOUT_MS`
    /// - `NEIGHBORHOOD_INDEX_WRITE_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            flush_interval_secs: env_or("NEIGHBORHOOD_INDEX_FLUSH_INTERVAL_SECS", d.flush_interval_secs),
            staleness_secs: env_or("NEIGHBORHOOD_INDEX_STALENESS_SECS", d.staleness_secs),
            retention_secs: env_or("NEIGHBORHOOD_INDEX_RETENTION_SECS", d.retention_secs),
            sweep_interval_secs: env_or("NEIGHBORHOOD_INDEX_SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            read_timeout_ms: env_or("NEIGHBORHOOD_INDEX_READ_TIMEOUT_MS", d.read_timeout_ms),
            write_timeout_ms: env_or("NEIGHBORHOOD_INDEX_WRITE_TIMEOUT_MS", d.write_timeout_ms),
        }
    }

    /// Reject zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Zero("index.flush_interval_secs"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("index.sweep_interval_secs"));
        }
        if self.retention_secs == 0 {
            return Err(ConfigError::Zero("index.retention_secs"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Zero("index.read_timeout_ms"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Zero("index.write_timeout_ms"));
        }
        Ok(())
    }

    /// Flush cadence.
    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.flush_interval_secs)
    }

    /// Expiration sweep cadence.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Buffer timing derived from this config.
    pub fn timing(&self) -> BufferTiming {
        BufferTiming {
            retention: Duration::seconds(self.retention_secs as i64),
            staleness: Duration::seconds(self.staleness_secs as i64),
            read_timeout: std::time::Duration::from_millis(self.read_timeout_ms),
            write_timeout: std::time::Duration::from_millis(self.write_timeout_ms),
        }
    }
}
