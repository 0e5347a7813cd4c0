//! Keyed persistence backends and the cache tiers layered on them.
//!
//! ## Tiers
//!
//! ```text
//! CachedStore<V>  ──►  MemoryCache (LRU + TTL)
//!        │
//!        └────────►  EphemeralStore (durable, TTL rows, row ceiling)
//!
//! MirroredStore<V> ──►  DurableStore (durable, no expiry), full in-memory mirror
//! ```
//!
//! Every durable key is `<table prefix><domain key>`; see [`keys`].

pub mod keys;
pub mod memory;
pub mod cache;
pub mod cached;
pub mod mirrored;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The ephemeral row ceiling was reached; an expiration sweep must run
    /// before new keys can be written.
    #[error("Ephemeral store full ({limit} rows); run an expiration sweep")]
    CapacityExceeded {
        /// Configured row ceiling.
        limit: u64,
    },
    /// A value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
    /// The operation exceeded its timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    /// Create a backend error from any error type.
    pub fn from_backend<E: std::error::Error>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Whether this is the row-ceiling error.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A row in the ephemeral store.
///
/// `value == None` is a negative entry: the key was looked up and not found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralRecord {
    /// Serialized payload, or `None` for a negative entry.
    pub value: Option<String>,
    /// Write time.
    pub written_at: DateTime<Utc>,
    /// Expiry; the row is invisible to reads from this instant on.
    pub expires_at: DateTime<Utc>,
}

impl EphemeralRecord {
    /// Whether the row is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Durable storage whose rows expire after a TTL.
///
/// Implementations enforce a global row ceiling: writing a *new* key while
/// at the ceiling fails with [`StoreError::CapacityExceeded`]; expired rows
/// still count until [`EphemeralStore::delete_expired`] removes them.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Fetch a live row. Expired rows read as `None`.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<EphemeralRecord>, StoreError>;

    /// Insert or overwrite a row.
    async fn put(&self, key: &str, record: EphemeralRecord) -> Result<(), StoreError>;

    /// Delete one row. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every row expired at `now`. Returns the number removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete every row whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Number of stored rows, expired or not.
    async fn row_count(&self) -> Result<u64, StoreError>;
}

/// Durable storage whose rows never expire.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch a row.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite a row.
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Delete a row. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All rows under `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Result of a cached lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Never looked up, or the entry expired.
    Unknown,
    /// Looked up before and known not to exist.
    Absent,
    /// Known value.
    Found(V),
}

impl<V> Lookup<V> {
    /// Whether a lookup result (positive or negative) is on record.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// The value, if found.
    pub fn found(self) -> Option<V> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }

    /// Build from a stored optional value.
    pub fn from_stored(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Found(v),
            None => Self::Absent,
        }
    }
}

/// Run a storage read under `timeout`.
pub(crate) async fn read_with_timeout<T, F>(timeout: Duration, read: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

/// Run a storage write under `timeout`.
pub(crate) async fn write_with_timeout<T, F>(timeout: Duration, write: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

pub use cache::{CacheConfig, CacheStats, MemoryCache};
pub use cached::{CachedEntry, CachedStore};
pub use memory::{InMemoryDurableStore, InMemoryEphemeralStore};
pub use mirrored::MirroredStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresDurableStore, PostgresEphemeralStore};
