//! Write-coalescing per-(group, hour) buffers over the ephemeral store.
//!
//! ## Lifecycle of a slot
//!
//! ```text
//! update ──► dirty ──flush──► clean ──idle > staleness──► evicted
//!              ▲                │
//!              └────update──────┘
//! ```
//!
//! A slot carries a write version. Flush snapshots dirty slots under the
//! lock, writes them without it, and marks a slot clean only if its version
//! did not move in between. Eviction only ever drops clean slots.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::keys::{bucket_key, full_key};
use crate::store::{read_with_timeout, write_with_timeout, EphemeralRecord, EphemeralStore, StoreError};
use crate::types::GroupId;
use super::bucket::HourBucket;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    version: u64,
    flushed_version: u64,
    touched_at: DateTime<Utc>,
}

impl<V> Slot<V> {
    fn is_dirty(&self) -> bool {
        self.version != self.flushed_version
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Buckets written and marked clean.
    pub flushed: usize,
    /// Buckets whose write failed; they stay dirty.
    pub failed: usize,
    /// Buckets written but modified during the write; they stay dirty.
    pub raced: usize,
}

/// Timing knobs for a [`BufferedIndex`].
#[derive(Debug, Clone, Copy)]
pub struct BufferTiming {
    /// How long flushed rows live in the ephemeral store.
    pub retention: Duration,
    /// How long a clean slot may sit untouched before eviction.
    pub staleness: Duration,
    /// Per-read timeout.
    pub read_timeout: std::time::Duration,
    /// Per-write timeout.
    pub write_timeout: std::time::Duration,
}

/// In-memory accumulator of `V` per (group, hour), flushed to `table`.
pub struct BufferedIndex<V> {
    table: &'static str,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    timing: BufferTiming,
    slots: Mutex<BTreeMap<(GroupId, HourBucket), Slot<V>>>,
}

impl<V> BufferedIndex<V>
where
    V: Default + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create an empty buffer.
    pub fn new(
        table: &'static str,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        timing: BufferTiming,
    ) -> Self {
        Self {
            table,
            store,
            clock,
            timing,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Table prefix.
    pub fn table(&self) -> &'static str {
        self.table
    }

    fn storage_key(&self, group: GroupId, hour: HourBucket) -> String {
        full_key(self.table, &bucket_key(group, hour))
    }

    async fn load(&self, group: GroupId, hour: HourBucket) -> Result<Option<V>, StoreError> {
        let key = self.storage_key(group, hour);
        let Some(record) = read_with_timeout(self.timing.read_timeout, self.store.get(&key, self.clock.now())).await? else {
            return Ok(None);
        };
        let Some(raw) = record.value else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding malformed index bucket");
                Ok(None)
            }
        }
    }

    /// Apply `mutate` to the bucket, loading it from storage first if it is
    /// not buffered. `mutate` returns whether it changed anything; only a
    /// change dirties the slot.
    pub async fn update<F>(&self, group: GroupId, hour: HourBucket, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let key = (group, hour);
        let mut loaded: Option<Option<V>> = None;
        loop {
            if loaded.is_none() && !self.slots.lock().contains_key(&key) {
                loaded = Some(self.load(group, hour).await?);
            }

            let now = self.clock.now();
            let mut slots = self.slots.lock();
            // Evicted between the check and this lock: go read storage.
            let Some(slot) = Self::slot_mut(&mut slots, key, &mut loaded, now) else {
                continue;
            };
            slot.touched_at = now;

            let changed = mutate(&mut slot.value);
            if changed {
                slot.version += 1;
            }
            return Ok(changed);
        }
    }

    /// The slot for `key`, created from `loaded` when missing. `None` when it
    /// is missing and storage was not consulted: a default value must never
    /// stand in for a bucket that may exist in storage.
    fn slot_mut<'a>(
        slots: &'a mut BTreeMap<(GroupId, HourBucket), Slot<V>>,
        key: (GroupId, HourBucket),
        loaded: &mut Option<Option<V>>,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Slot<V>> {
        match slots.entry(key) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(entry) => {
                let value = loaded.take()?;
                Some(entry.insert(Slot {
                    value: value.unwrap_or_default(),
                    version: 0,
                    flushed_version: 0,
                    touched_at: now,
                }))
            }
        }
    }

    /// Current contents of a bucket: the buffered value if present,
    /// otherwise whatever storage holds.
    pub async fn get(&self, group: GroupId, hour: HourBucket) -> Result<Option<V>, StoreError> {
        let buffered = self.slots.lock().get(&(group, hour)).map(|slot| slot.value.clone());
        match buffered {
            Some(value) => Ok(Some(value)),
            None => self.load(group, hour).await,
        }
    }

    /// Write every dirty bucket.
    ///
    /// Failures are logged and counted; the affected slots stay dirty and are
    /// retried on the next flush.
    pub async fn flush(&self) -> FlushReport {
        let snapshot: Vec<((GroupId, HourBucket), V, u64)> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|(_, slot)| slot.is_dirty())
                .map(|(id, slot)| (*id, slot.value.clone(), slot.version))
                .collect()
        };

        let mut report = FlushReport::default();
        for ((group, hour), value, version) in snapshot {
            let key = self.storage_key(group, hour);
            match self.write(&key, &value).await {
                Ok(()) => {
                    let mut slots = self.slots.lock();
                    match slots.get_mut(&(group, hour)) {
                        Some(slot) if slot.version == version => {
                            slot.flushed_version = version;
                            report.flushed += 1;
                        }
                        _ => report.raced += 1,
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Index bucket flush failed");
                    report.failed += 1;
                }
            }
        }

        if report != FlushReport::default() {
            debug!(
                table = self.table,
                flushed = report.flushed,
                failed = report.failed,
                raced = report.raced,
                "Flushed index buffers"
            );
        }
        report
    }

    async fn write(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let now = self.clock.now();
        let record = EphemeralRecord {
            value: Some(serde_json::to_string(value)?),
            written_at: now,
            expires_at: now + self.timing.retention,
        };
        write_with_timeout(self.timing.write_timeout, self.store.put(key, record)).await
    }

    /// Drop clean slots untouched for longer than the staleness window.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let staleness = self.timing.staleness;
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.is_dirty() || now - slot.touched_at < staleness);
        before - slots.len()
    }

    /// Drop every slot whose storage key starts with `prefix`, dirty or not.
    ///
    /// Only for administrative resets: unflushed writes are lost.
    pub fn drop_prefix(&self, prefix: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        let table = self.table;
        slots.retain(|(group, hour), _| !full_key(table, &bucket_key(*group, *hour)).starts_with(prefix));
        before - slots.len()
    }

    /// Number of buffered slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Number of slots awaiting a flush.
    pub fn dirty_count(&self) -> usize {
        self.slots.lock().values().filter(|slot| slot.is_dirty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryEphemeralStore;
    use chrono::TimeZone;

    type Counter = BTreeMap<String, u32>;

    fn setup() -> (BufferedIndex<Counter>, Arc<InMemoryEphemeralStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let store = Arc::new(InMemoryEphemeralStore::new(100));
        let timing = BufferTiming {
            retention: Duration::days(3),
            staleness: Duration::minutes(10),
            read_timeout: std::time::Duration::from_secs(1),
            write_timeout: std::time::Duration::from_secs(1),
        };
        let buffer = BufferedIndex::new("counter:", store.clone(), clock.clone(), timing);
        (buffer, store, clock)
    }

    fn bump(key: &'static str) -> impl FnOnce(&mut Counter) -> bool {
        move |c| {
            *c.entry(key.to_string()).or_default() += 1;
            true
        }
    }

    #[tokio::test]
    async fn test_flush_then_evict() {
        let (buffer, store, clock) = setup();
        let hour = HourBucket::containing(clock.now());

        buffer.update(GroupId(1), hour, bump("a")).await.unwrap();
        assert_eq!(buffer.dirty_count(), 1);

        // Dirty slots survive any amount of idleness.
        clock.advance(Duration::hours(1));
        assert_eq!(buffer.evict_idle(), 0);

        assert_eq!(buffer.flush().await.flushed, 1);
        assert_eq!(buffer.dirty_count(), 0);
        assert_eq!(store.keys(), vec!["counter:1:2024-03-01T12".to_string()]);

        clock.advance(Duration::minutes(11));
        assert_eq!(buffer.evict_idle(), 1);
        assert!(buffer.is_empty());

        // Reloaded from storage on the next write.
        buffer.update(GroupId(1), hour, bump("a")).await.unwrap();
        assert_eq!(buffer.get(GroupId(1), hour).await.unwrap().unwrap()["a"], 2);
    }

    #[tokio::test]
    async fn test_evicted_slot_is_never_recreated_empty() {
        let (buffer, store, clock) = setup();
        let hour = HourBucket::containing(clock.now());
        let key = (GroupId(1), hour);

        buffer.update(GroupId(1), hour, bump("a")).await.unwrap();
        buffer.update(GroupId(1), hour, bump("b")).await.unwrap();
        buffer.flush().await;
        clock.advance(Duration::minutes(11));
        assert_eq!(buffer.evict_idle(), 1);

        // Slot gone and storage not consulted: no default stand-in.
        let mut not_loaded = None;
        assert!(BufferedIndex::slot_mut(&mut buffer.slots.lock(), key, &mut not_loaded, clock.now()).is_none());
        assert!(buffer.is_empty());

        buffer.update(GroupId(1), hour, bump("a")).await.unwrap();
        buffer.flush().await;
        let stored = store.get("counter:1:2024-03-01T12", clock.now()).await.unwrap().unwrap();
        let counts: Counter = serde_json::from_str(&stored.value.unwrap()).unwrap();
        assert_eq!(counts, Counter::from([("a".to_string(), 2), ("b".to_string(), 1)]));
    }

    #[tokio::test]
    async fn test_noop_update_stays_clean() {
        let (buffer, _, clock) = setup();
        let hour = HourBucket::containing(clock.now());

        assert!(!buffer.update(GroupId(1), hour, |_| false).await.unwrap());
        assert_eq!(buffer.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_slot_dirty() {
        let (buffer, store, clock) = setup();
        let hour = HourBucket::containing(clock.now());
        buffer.update(GroupId(1), hour, bump("a")).await.unwrap();

        store.set_unavailable(true);
        let report = buffer.flush().await;
        assert_eq!(report.failed, 1);

        clock.advance(Duration::hours(2));
        assert_eq!(buffer.evict_idle(), 0);

        store.set_unavailable(false);
        assert_eq!(buffer.flush().await.flushed, 1);
    }

    #[tokio::test]
    async fn test_drop_prefix_is_group_scoped() {
        let (buffer, _, clock) = setup();
        let hour = HourBucket::containing(clock.now());
        buffer.update(GroupId(4), hour, bump("a")).await.unwrap();
        buffer.update(GroupId(42), hour, bump("a")).await.unwrap();

        assert_eq!(buffer.drop_prefix("counter:4:"), 1);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.get(GroupId(42), hour).await.unwrap().is_some());
    }
}
