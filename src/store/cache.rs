//! In-memory cache tier: LRU-bounded, TTL-expiring.
//!
//! ## Eviction
//!
//! An entry leaves the cache when it is the least recently used entry and
//! the cache is full, when its TTL passes (checked lazily on read), or when
//! it is removed explicitly. Reads of an expired entry pop it.

use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Configuration for an in-memory cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache.
    pub max_entries: usize,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Whether to enable the cache.
    pub enabled: bool,
    /// Timeout for one durable read behind the cache, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 600,
            enabled: true,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `NEIGHBORHOOD_CACHE_MAX_ENTRIES`
    /// - `NEIGHBORHOOD_CACHE_TTL_SECS`
    /// - `NEIGHBORHOOD_CACHE_ENABLED`
    /// - `NEIGHBORHOOD_CACHE_READ_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: crate::config::env_or("NEIGHBORHOOD_CACHE_MAX_ENTRIES", defaults.max_entries),
            ttl_secs: crate::config::env_or("NEIGHBORHOOD_CACHE_TTL_SECS", defaults.ttl_secs),
            enabled: crate::config::env_or("NEIGHBORHOOD_CACHE_ENABLED", defaults.enabled),
            read_timeout_ms: crate::config::env_or("NEIGHBORHOOD_CACHE_READ_TIMEOUT_MS", defaults.read_timeout_ms),
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs as i64)
    }

    /// Timeout for durable reads behind the cache.
    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Current number of entries in the cache.
    pub len: usize,
    /// Maximum capacity of the cache.
    pub cap: usize,
}

/// Thread-safe LRU cache with per-entry expiry.
///
/// A disabled cache stores nothing and misses every read.
pub struct MemoryCache<V> {
    entries: Option<Mutex<LruCache<String, CacheEntry<V>>>>,
    ttl: Duration,
}

impl<V: Clone> MemoryCache<V> {
    /// Create a cache from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let entries = if config.enabled {
            NonZeroUsize::new(config.max_entries).map(|cap| Mutex::new(LruCache::new(cap)))
        } else {
            None
        };
        Self { entries, ttl: config.ttl() }
    }

    /// Fetch a live entry, refreshing its recency.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let mut entries = self.entries.as_ref()?.lock();
        let expired = entries.peek(key)?.expires_at <= now;
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert an entry living for the cache TTL, or until `not_after` if
    /// that comes first.
    pub fn put(&self, key: &str, value: V, now: DateTime<Utc>, not_after: Option<DateTime<Utc>>) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let mut expires_at = now + self.ttl;
        if let Some(limit) = not_after {
            expires_at = expires_at.min(limit);
        }
        if expires_at <= now {
            return;
        }
        entries.lock().put(key.to_string(), CacheEntry { value, expires_at });
    }

    /// Remove one entry.
    pub fn remove(&self, key: &str) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(key);
        }
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let Some(entries) = &self.entries else {
            return 0;
        };
        let mut entries = entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    /// Get cache statistics.
    ///
    /// Returns `None` if caching is disabled.
    pub fn stats(&self) -> Option<CacheStats> {
        self.entries.as_ref().map(|entries| {
            let entries = entries.lock();
            CacheStats {
                len: entries.len(),
                cap: entries.cap().get(),
            }
        })
    }
}
