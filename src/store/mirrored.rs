//! Long-lived store with an authoritative in-memory mirror.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use super::keys::full_key;
use super::{DurableStore, StoreError};

/// Table-scoped long-lived store.
///
/// [`MirroredStore::load`] reads every row under the table prefix once;
/// afterwards memory is authoritative. Mutations write through to durable
/// storage first and only touch memory once the write succeeded, so memory
/// never holds a value durable storage lacks. Key enumeration never touches
/// durable storage.
pub struct MirroredStore<V> {
    table: &'static str,
    store: Arc<dyn DurableStore>,
    entries: RwLock<BTreeMap<String, V>>,
}

impl<V> MirroredStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Load every row of `table` into memory.
    ///
    /// Rows that fail to deserialize are skipped with a warning.
    pub async fn load(table: &'static str, store: Arc<dyn DurableStore>) -> Result<Self, StoreError> {
        let rows = store.scan_prefix(table).await?;
        let mut entries = BTreeMap::new();
        let mut skipped = 0usize;

        for (key, raw) in rows {
            let domain_key = key[table.len()..].to_string();
            match serde_json::from_str::<V>(&raw) {
                Ok(value) => {
                    entries.insert(domain_key, value);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(key = %key, error = %e, "Skipping malformed long-lived row");
                }
            }
        }

        info!(table = table, loaded = entries.len(), skipped = skipped, "Loaded long-lived table");

        Ok(Self {
            table,
            store,
            entries: RwLock::new(entries),
        })
    }

    /// Table prefix.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Value for `key`, from memory.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Whether `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// All keys, ordered.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write `value` through to durable storage, then memory.
    pub async fn put(&self, key: &str, value: V) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&value)?;
        self.store.put(&full_key(self.table, key), raw).await?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Delete `key` from durable storage, then memory.
    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.store.delete(&full_key(self.table, key)).await?;
        let in_memory = self.entries.write().remove(key).is_some();
        Ok(existed || in_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryDurableStore;

    #[tokio::test]
    async fn test_load_put_and_enumerate() {
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.put("result:1", "10".into()).await.unwrap();
        durable.put("result:2", "bogus".into()).await.unwrap();
        durable.put("other:1", "99".into()).await.unwrap();

        let store: MirroredStore<u32> = MirroredStore::load("result:", durable.clone()).await.unwrap();
        assert_eq!(store.keys(), vec!["1".to_string()]);
        assert_eq!(store.get("1"), Some(10));

        store.put("3", 30).await.unwrap();
        assert_eq!(durable.get("result:3").await.unwrap(), Some("30".to_string()));

        let reloaded: MirroredStore<u32> = MirroredStore::load("result:", durable).await.unwrap();
        assert_eq!(reloaded.keys(), vec!["1".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let store: MirroredStore<u32> = MirroredStore::load("result:", durable.clone()).await.unwrap();

        durable.set_unavailable(true);
        assert!(store.put("1", 1).await.is_err());
        assert!(!store.contains("1"));
    }

    #[tokio::test]
    async fn test_remove() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let store: MirroredStore<u32> = MirroredStore::load("result:", durable.clone()).await.unwrap();
        store.put("1", 1).await.unwrap();

        assert!(store.remove("1").await.unwrap());
        assert!(store.is_empty());
        assert!(durable.is_empty());
    }
}
