//! Read-through / write-through composite of [`MemoryCache`] and an
//! [`EphemeralStore`].

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{trace, warn};

use crate::clock::Clock;
use super::cache::{CacheConfig, CacheStats, MemoryCache};
use super::keys::full_key;
use super::{read_with_timeout, EphemeralRecord, EphemeralStore, Lookup, StoreError};

/// A cached value (or negative entry) with its durable expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry<V> {
    /// The value; `None` for a negative entry.
    pub value: Option<V>,
    /// When the durable row expires.
    pub expires_at: DateTime<Utc>,
}

impl<V> CachedEntry<V> {
    /// Time left before expiry at `now` (zero when already expired).
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Typed, table-scoped cached store.
///
/// Reads hit the memory tier first, then the durable tier (repopulating
/// memory on a hit). A total miss is [`Lookup::Unknown`]; a stored `None`
/// is [`Lookup::Absent`]. Writes go durable-first; the memory tier is only
/// updated once the durable write succeeded.
pub struct CachedStore<V> {
    table: &'static str,
    cache: MemoryCache<CachedEntry<V>>,
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
    read_timeout: std::time::Duration,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> CachedStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Create a store for `table` whose durable rows live for `ttl`.
    pub fn new(
        table: &'static str,
        store: Arc<dyn EphemeralStore>,
        cache_config: &CacheConfig,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table,
            cache: MemoryCache::new(cache_config),
            store,
            ttl,
            read_timeout: cache_config.read_timeout(),
            clock,
            _marker: PhantomData,
        }
    }

    /// Table prefix.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Default TTL of written rows.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch the entry for `key`, or `None` when nothing is on record.
    ///
    /// Malformed durable payloads are logged and treated as unknown. A
    /// durable read slower than the configured read timeout fails with
    /// [`StoreError::Timeout`].
    pub async fn get_entry(&self, key: &str) -> Result<Option<CachedEntry<V>>, StoreError> {
        let full = full_key(self.table, key);
        let now = self.clock.now();

        if let Some(entry) = self.cache.get(&full, now) {
            trace!(key = %full, "cache hit");
            return Ok(Some(entry));
        }

        let Some(record) = read_with_timeout(self.read_timeout, self.store.get(&full, now)).await? else {
            trace!(key = %full, "cache miss");
            return Ok(None);
        };

        let value = match record.value {
            None => None,
            Some(raw) => match serde_json::from_str::<V>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %full, error = %e, "Discarding malformed stored payload");
                    return Ok(None);
                }
            },
        };

        let entry = CachedEntry { value, expires_at: record.expires_at };
        self.cache.put(&full, entry.clone(), now, Some(record.expires_at));
        Ok(Some(entry))
    }

    /// Look up `key`.
    pub async fn get(&self, key: &str) -> Result<Lookup<V>, StoreError> {
        Ok(match self.get_entry(key).await? {
            None => Lookup::Unknown,
            Some(entry) => Lookup::from_stored(entry.value),
        })
    }

    /// Store `value` (or a negative entry) with the default TTL.
    pub async fn store(&self, key: &str, value: Option<V>) -> Result<(), StoreError> {
        self.store_with_ttl(key, value, self.ttl).await
    }

    /// Store `value` (or a negative entry) expiring after `ttl`.
    pub async fn store_with_ttl(&self, key: &str, value: Option<V>, ttl: Duration) -> Result<(), StoreError> {
        let full = full_key(self.table, key);
        let now = self.clock.now();
        let expires_at = now + ttl;
        let raw = value.as_ref().map(serde_json::to_string).transpose()?;

        let record = EphemeralRecord { value: raw, written_at: now, expires_at };
        if let Err(e) = self.store.put(&full, record).await {
            self.cache.remove(&full);
            return Err(e);
        }

        self.cache.put(&full, CachedEntry { value, expires_at }, now, Some(expires_at));
        Ok(())
    }

    /// Delete `key` from both tiers.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let full = full_key(self.table, key);
        self.cache.remove(&full);
        self.store.delete(&full).await
    }

    /// Drop every memory-tier entry of this table.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop memory-tier entries whose full key starts with `prefix`.
    pub fn evict_cached_prefix(&self, prefix: &str) -> usize {
        self.cache.remove_prefix(prefix)
    }

    /// Memory-tier statistics.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }
}
