//! Crawl tunables.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::{env_or, ConfigError};

/// Crawl worker configuration.
///
/// ## Environment Variables
///
/// Each field reads `NEIGHBORHOOD_CRAWL_<FIELD>` (upper-cased), e.g.
/// `NEIGHBORHOOD_CRAWL_BATCH_SIZE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Seconds between scheduler ticks.
    pub scheduler_interval_secs: u64,
    /// Milliseconds between crawl ticks.
    pub crawl_interval_ms: u64,
    /// Fetch requests processed per crawl tick.
    pub batch_size: usize,
    /// Failed attempts tolerated per request before the account is errored.
    pub max_fetch_retries: u32,
    /// Stop expanding once members + close neighbors - errored members
    /// reaches this.
    pub enough_actors: usize,
    /// Cap on close + far neighbors.
    pub max_neighbors: usize,
    /// Far neighbors need a combined follow count above this.
    pub min_far_neighbor_follows: u32,
    /// Abort when errors exceed this fraction of members + close neighbors.
    pub max_error_ratio: f64,
    /// Re-crawl a successfully crawled group after this many seconds.
    pub success_cooldown_secs: u64,
    /// Re-crawl a group whose last crawl failed after this many seconds.
    pub failure_cooldown_secs: u64,
    /// Capacity of the fetch work queue.
    pub queue_capacity: usize,
    /// Timeout for one client call, in milliseconds.
    pub read_timeout_ms: u64,
    /// Timeout for one durable write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Lifetime of cached follow lists, in seconds.
    pub follow_list_ttl_secs: u64,
    /// Lifetime of cached account lookups, in seconds.
    pub account_ttl_secs: u64,
    /// Page limit for on-demand full follow-list fetches.
    pub max_pages_per_fetch: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: 60,
            crawl_interval_ms: 1_000,
            batch_size: 10,
            max_fetch_retries: 3,
            enough_actors: 100,
            max_neighbors: 500,
            min_far_neighbor_follows: 1,
            max_error_ratio: 0.5,
            success_cooldown_secs: 24 * 3600,
            failure_cooldown_secs: 3600,
            queue_capacity: 10_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
            follow_list_ttl_secs: 7 * 24 * 3600,
            account_ttl_secs: 24 * 3600,
            max_pages_per_fetch: 1_000,
        }
    }
}

impl CrawlConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            scheduler_interval_secs: env_or("NEIGHBORHOOD_CRAWL_SCHEDULER_INTERVAL_SECS", d.scheduler_interval_secs),
            crawl_interval_ms: env_or("NEIGHBORHOOD_CRAWL_CRAWL_INTERVAL_MS", d.crawl_interval_ms),
            batch_size: env_or("NEIGHBORHOOD_CRAWL_BATCH_SIZE", d.batch_size),
            max_fetch_retries: env_or("NEIGHBORHOOD_CRAWL_MAX_FETCH_RETRIES", d.max_fetch_retries),
            enough_actors: env_or("NEIGHBORHOOD_CRAWL_ENOUGH_ACTORS", d.enough_actors),
            max_neighbors: env_or("NEIGHBORHOOD_CRAWL_MAX_NEIGHBORS", d.max_neighbors),
            min_far_neighbor_follows: env_or("NEIGHBORHOOD_CRAWL_MIN_FAR_NEIGHBOR_FOLLOWS", d.min_far_neighbor_follows),
            max_error_ratio: env_or("NEIGHBORHOOD_CRAWL_MAX_ERROR_RATIO", d.max_error_ratio),
            success_cooldown_secs: env_or("NEIGHBORHOOD_CRAWL_SUCCESS_COOLDOWN_SECS", d.success_cooldown_secs),
            failure_cooldown_secs: env_or("NEIGHBORHOOD_CRAWL_FAILURE_COOLDOWN_SECS", d.failure_cooldown_secs),
            queue_capacity: env_or("NEIGHBORHOOD_CRAWL_QUEUE_CAPACITY", d.queue_capacity),
            read_timeout_ms: env_or("NEIGHBORHOOD_CRAWL_READ_TIMEOUT_MS", d.read_timeout_ms),
            write_timeout_ms: env_or("NEIGHBORHOOD_CRAWL_WRITE_TIMEOUT_MS", d.write_timeout_ms),
            follow_list_ttl_secs: env_or("NEIGHBORHOOD_CRAWL_FOLLOW_LIST_TTL_SECS", d.follow_list_ttl_secs),
            account_ttl_secs: env_or("NEIGHBORHOOD_CRAWL_ACCOUNT_TTL_SECS", d.account_ttl_secs),
            max_pages_per_fetch: env_or("NEIGHBORHOOD_CRAWL_MAX_PAGES_PER_FETCH", d.max_pages_per_fetch),
        }
    }

    /// Reject nonsensical settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (self.batch_size, "crawl.batch_size"),
            (self.queue_capacity, "crawl.queue_capacity"),
            (self.max_neighbors, "crawl.max_neighbors"),
            (self.max_pages_per_fetch, "crawl.max_pages_per_fetch"),
        ];
        for (value, name) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.scheduler_interval_secs == 0 {
            return Err(ConfigError::Zero("crawl.scheduler_interval_secs"));
        }
        if self.crawl_interval_ms == 0 {
            return Err(ConfigError::Zero("crawl.crawl_interval_ms"));
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::Zero("crawl timeouts"));
        }
        if !(self.max_error_ratio > 0.0 && self.max_error_ratio <= 1.0) {
            return Err(ConfigError::ErrorRatio(self.max_error_ratio));
        }
        if self.failure_cooldown_secs > self.success_cooldown_secs {
            return Err(ConfigError::CooldownOrder);
        }
        Ok(())
    }

    /// Client call timeout.
    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_timeout_ms)
    }

    /// Durable write timeout.
    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_timeout_ms)
    }

    /// Scheduler tick period.
    pub fn scheduler_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scheduler_interval_secs)
    }

    /// Crawl tick period.
    pub fn crawl_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.crawl_interval_ms)
    }

    /// Cooldown after a successful crawl.
    pub fn success_cooldown(&self) -> Duration {
        Duration::seconds(self.success_cooldown_secs as i64)
    }

    /// Cooldown after a failed crawl.
    pub fn failure_cooldown(&self) -> Duration {
        Duration::seconds(self.failure_cooldown_secs as i64)
    }

    /// Follow-list cache lifetime.
    pub fn follow_list_ttl(&self) -> Duration {
        Duration::seconds(self.follow_list_ttl_secs as i64)
    }

    /// Account cache lifetime.
    pub fn account_ttl(&self) -> Duration {
        Duration::seconds(self.account_ttl_secs as i64)
    }
}
