//! In-memory durable backends for tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{DurableStore, EphemeralRecord, EphemeralStore, StoreError};

/// Default ephemeral row ceiling.
pub const DEFAULT_MAX_EPHEMERAL_ROWS: u64 = 100_000;

/// In-memory ephemeral store.
///
/// Uses BTreeMap for deterministic iteration and cheap prefix ranges.
#[derive(Debug)]
pub struct InMemoryEphemeralStore {
    rows: RwLock<BTreeMap<String, EphemeralRecord>>,
    max_rows: u64,
    /// Simulated outage: every operation fails while set.
    unavailable: AtomicBool,
}

impl InMemoryEphemeralStore {
    /// Create a store with the given row ceiling.
    pub fn new(max_rows: u64) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            max_rows,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Toggle a simulated backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Row ceiling.
    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// All keys, including expired rows.
    pub fn keys(&self) -> Vec<String> {
        self.rows.read().keys().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EPHEMERAL_ROWS)
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<EphemeralRecord>, StoreError> {
        self.check_available()?;
        Ok(self.rows
            .read()
            .get(key)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn put(&self, key: &str, record: EphemeralRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write();
        if !rows.contains_key(key) && rows.len() as u64 >= self.max_rows {
            return Err(StoreError::CapacityExceeded { limit: self.max_rows });
        }
        rows.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.rows.write().remove(key).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, r| !r.is_expired(now));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write();
        let doomed: Vec<String> = rows
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.rows.read().len() as u64)
    }
}

/// In-memory long-lived store.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    rows: RwLock<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl InMemoryDurableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.rows.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.check_available()?;
        self.rows.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.rows.write().remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check_available()?;
        Ok(self.rows
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn record(value: &str, ttl_minutes: i64) -> EphemeralRecord {
        EphemeralRecord {
            value: Some(value.to_string()),
            written_at: t0(),
            expires_at: t0() + Duration::minutes(ttl_minutes),
        }
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let store = InMemoryEphemeralStore::new(10);
        store.put("k", record("v", 5)).await.unwrap();

        assert!(store.get("k", t0()).await.unwrap().is_some());
        assert!(store.get("k", t0() + Duration::minutes(5)).await.unwrap().is_none());
        // Still counted until swept.
        assert_eq!(store.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_row_ceiling_requires_sweep() {
        let store = InMemoryEphemeralStore::new(2);
        store.put("a", record("1", 5)).await.unwrap();
        store.put("b", record("2", 5)).await.unwrap();

        let err = store.put("c", record("3", 5)).await.unwrap_err();
        assert_eq!(err, StoreError::CapacityExceeded { limit: 2 });

        // Overwriting an existing key is allowed at the ceiling.
        store.put("a", record("1b", 5)).await.unwrap();

        // Sweeping before expiry frees nothing.
        assert_eq!(store.delete_expired(t0()).await.unwrap(), 0);
        assert!(store.put("c", record("3", 5)).await.is_err());

        assert_eq!(store.delete_expired(t0() + Duration::minutes(6)).await.unwrap(), 2);
        store.put("c", record("3", 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = InMemoryEphemeralStore::new(10);
        store.put("post_index:4:2024-03-01T12", record("a", 5)).await.unwrap();
        store.put("post_index:42:2024-03-01T12", record("b", 5)).await.unwrap();
        store.put("reference_index:4:2024-03-01T12", record("c", 5)).await.unwrap();

        assert_eq!(store.delete_prefix("post_index:4:").await.unwrap(), 1);
        assert_eq!(store.keys(), vec![
            "post_index:42:2024-03-01T12".to_string(),
            "reference_index:4:2024-03-01T12".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_durable_scan_prefix() {
        let store = InMemoryDurableStore::new();
        store.put("neighbors:1", "a".into()).await.unwrap();
        store.put("neighbors:2", "b".into()).await.unwrap();
        store.put("crawl_result:1", "c".into()).await.unwrap();

        let rows = store.scan_prefix("neighbors:").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "neighbors:1");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryDurableStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.put("k", "v".into()).await, Err(StoreError::Backend(_))));
    }
}
