//! Persistence layer behavior across tiers: the ephemeral row ceiling, the
//! cached store's negative entries, and the long-lived mirror surviving a
//! reload.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use neighborhood_kernel::crawl::CrawlRecords;
use neighborhood_kernel::index::{BufferTiming, BufferedIndex};
use neighborhood_kernel::{
    CacheConfig, CachedStore, Clock, DurableStore, EphemeralRecord, EphemeralStore, GroupId, HourBucket,
    InMemoryDurableStore, InMemoryEphemeralStore, Lookup, ManualClock, MirroredStore, StoreError,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn record(value: &str, written_at: DateTime<Utc>, ttl_minutes: i64) -> EphemeralRecord {
    EphemeralRecord {
        value: Some(value.to_string()),
        written_at,
        expires_at: written_at + Duration::minutes(ttl_minutes),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row ceiling
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_row_ceiling_until_sweep() {
    let store = InMemoryEphemeralStore::new(3);
    store.put("account:a", record("a", t0(), 10)).await.unwrap();
    store.put("account:b", record("b", t0(), 10)).await.unwrap();
    store.put("account:c", record("c", t0(), 60)).await.unwrap();

    let full = store.put("account:d", record("d", t0(), 10)).await;
    assert_eq!(full, Err(StoreError::CapacityExceeded { limit: 3 }));

    // Overwrites never count against the ceiling.
    store.put("account:a", record("a2", t0(), 10)).await.unwrap();

    // Expired rows still occupy their slots until the sweep.
    let later = t0() + Duration::minutes(30);
    assert!(store.get("account:b", later).await.unwrap().is_none());
    assert!(store.put("account:d", record("d", later, 10)).await.unwrap_err().is_capacity());

    assert_eq!(store.delete_expired(later).await.unwrap(), 2);
    assert_eq!(store.row_count().await.unwrap(), 1);
    store.put("account:d", record("d", later, 10)).await.unwrap();
    assert_eq!(store.get("account:c", later).await.unwrap().and_then(|r| r.value), Some("c".to_string()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Cached store
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cached_store_survives_cache_clear() {
    let clock = Arc::new(ManualClock::new(t0()));
    let ephemeral: Arc<dyn EphemeralStore> = Arc::new(InMemoryEphemeralStore::new(100));
    let store: CachedStore<Vec<String>> = CachedStore::new(
        "follows:",
        ephemeral.clone(),
        &CacheConfig::default(),
        Duration::hours(1),
        clock.clone(),
    );

    store.store("present", Some(vec!["x".to_string()])).await.unwrap();
    store.store("missing", None).await.unwrap();
    assert_eq!(store.get("present").await.unwrap(), Lookup::Found(vec!["x".to_string()]));
    assert_eq!(store.get("missing").await.unwrap(), Lookup::Absent);
    assert_eq!(store.get("never").await.unwrap(), Lookup::Unknown);

    store.clear_cache();
    assert_eq!(store.get("present").await.unwrap(), Lookup::Found(vec!["x".to_string()]));
    assert_eq!(store.get("missing").await.unwrap(), Lookup::Absent);

    // A second handle over the same durable rows sees them too.
    let other: CachedStore<Vec<String>> =
        CachedStore::new("follows:", ephemeral, &CacheConfig::default(), Duration::hours(1), clock.clone());
    assert_eq!(other.get("missing").await.unwrap(), Lookup::Absent);

    clock.advance(Duration::hours(2));
    assert_eq!(store.get("present").await.unwrap(), Lookup::Unknown);
    assert_eq!(other.get("missing").await.unwrap(), Lookup::Unknown);
    assert_eq!(clock.now(), t0() + Duration::hours(2));
}

#[tokio::test]
async fn test_malformed_payload_reads_as_unknown() {
    let clock = Arc::new(ManualClock::new(t0()));
    let ephemeral = Arc::new(InMemoryEphemeralStore::new(100));
    ephemeral.put("follows:bad", record("{not json", t0(), 60)).await.unwrap();

    let store: CachedStore<Vec<String>> =
        CachedStore::new("follows:", ephemeral, &CacheConfig::default(), Duration::hours(1), clock);
    assert_eq!(store.get("bad").await.unwrap(), Lookup::Unknown);
}

#[tokio::test]
async fn test_failed_durable_write_leaves_cache_untouched() {
    let clock = Arc::new(ManualClock::new(t0()));
    let ephemeral = Arc::new(InMemoryEphemeralStore::new(1));
    let store: CachedStore<u32> =
        CachedStore::new("account:", ephemeral.clone(), &CacheConfig::default(), Duration::hours(1), clock);

    store.store("a", Some(1)).await.unwrap();
    assert!(store.store("b", Some(2)).await.unwrap_err().is_capacity());
    assert_eq!(store.get("b").await.unwrap(), Lookup::Unknown);
    assert_eq!(store.get("a").await.unwrap(), Lookup::Found(1));
}

// ─────────────────────────────────────────────────────────────────────────────
// Long-lived mirror
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mirror_reloads_from_durable_rows() {
    let durable = Arc::new(InMemoryDurableStore::new());
    let mirror: MirroredStore<u64> = MirroredStore::load("neighbors:", durable.clone()).await.unwrap();
    mirror.put("1", 10).await.unwrap();
    mirror.put("2", 20).await.unwrap();
    assert!(mirror.remove("1").await.unwrap());

    durable.put("neighbors:3", "not a number".to_string()).await.unwrap();
    durable.put("crawl_result:1", "99".to_string()).await.unwrap();

    let reloaded: MirroredStore<u64> = MirroredStore::load("neighbors:", durable.clone()).await.unwrap();
    assert_eq!(reloaded.keys(), vec!["2".to_string()]);
    assert_eq!(reloaded.get("2"), Some(20));

    durable.set_unavailable(true);
    assert!(reloaded.put("4", 40).await.is_err());
    assert!(!reloaded.contains("4"));
    assert_eq!(reloaded.len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Stalled backends
// ─────────────────────────────────────────────────────────────────────────────

/// A backend that accepts connections and never answers.
struct StalledStore;

async fn never<T>() -> T {
    std::future::pending().await
}

#[async_trait]
impl EphemeralStore for StalledStore {
    async fn get(&self, _key: &str, _now: DateTime<Utc>) -> Result<Option<EphemeralRecord>, StoreError> {
        never().await
    }

    async fn put(&self, _key: &str, _record: EphemeralRecord) -> Result<(), StoreError> {
        never().await
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        never().await
    }

    async fn delete_expired(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        never().await
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64, StoreError> {
        never().await
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        never().await
    }
}

#[async_trait]
impl DurableStore for StalledStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        never().await
    }

    async fn put(&self, _key: &str, _value: String) -> Result<(), StoreError> {
        never().await
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        never().await
    }

    async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        never().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_reads_time_out() {
    let clock = Arc::new(ManualClock::new(t0()));
    let read_timeout = std::time::Duration::from_millis(50);

    let config = CacheConfig { read_timeout_ms: 50, ..CacheConfig::default() };
    let cached: CachedStore<u32> =
        CachedStore::new("account:", Arc::new(StalledStore), &config, Duration::hours(1), clock.clone());
    assert_eq!(cached.get("a").await, Err(StoreError::Timeout(read_timeout)));

    let timing = BufferTiming {
        retention: Duration::days(3),
        staleness: Duration::minutes(10),
        read_timeout,
        write_timeout: read_timeout,
    };
    let index: BufferedIndex<BTreeMap<String, u32>> =
        BufferedIndex::new("post_index:", Arc::new(StalledStore), clock.clone(), timing);
    let hour = HourBucket::containing(clock.now());
    let bumped = index.update(GroupId(1), hour, |counts| {
        *counts.entry("p".to_string()).or_default() += 1;
        true
    });
    assert_eq!(bumped.await, Err(StoreError::Timeout(read_timeout)));
    assert!(index.is_empty());
    assert_eq!(index.get(GroupId(1), hour).await, Err(StoreError::Timeout(read_timeout)));

    let records = CrawlRecords::load(Arc::new(StalledStore), read_timeout, read_timeout).await;
    assert!(matches!(records, Err(StoreError::Timeout(_))));
}
