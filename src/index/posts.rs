//! Post appearance buckets.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::Clock;
use crate::store::keys::POST_INDEX_PREFIX;
use crate::store::{EphemeralStore, StoreError};
use crate::types::{GroupId, PostId, PostIndex};
use super::bucket::HourBucket;
use super::buffer::{BufferTiming, BufferedIndex, FlushReport};

/// Posts that appeared in one (group, hour), deduplicated by post id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostIndexBucket {
    posts: BTreeMap<PostId, PostIndex>,
}

impl PostIndexBucket {
    /// Add a post. Returns `false` if the id was already present.
    pub fn insert(&mut self, index: PostIndex) -> bool {
        if self.posts.contains_key(&index.post_id) {
            return false;
        }
        self.posts.insert(index.post_id.clone(), index);
        true
    }

    /// Entry for `post_id`.
    pub fn get(&self, post_id: &PostId) -> Option<&PostIndex> {
        self.posts.get(post_id)
    }

    /// Entries ordered by post id.
    pub fn iter(&self) -> impl Iterator<Item = &PostIndex> {
        self.posts.values()
    }

    /// Number of posts.
    pub fn len(&self) -> usize {
        self.posts.len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}

/// Buffered post index, one bucket per (group, hour).
pub struct PostIndexBuffer {
    inner: BufferedIndex<PostIndexBucket>,
}

impl PostIndexBuffer {
    /// Create a buffer over `store`.
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>, timing: BufferTiming) -> Self {
        Self { inner: BufferedIndex::new(POST_INDEX_PREFIX, store, clock, timing) }
    }

    /// Record that `index` appeared in the group's timeline during `hour`.
    ///
    /// Re-adding a post already in the bucket is a no-op and leaves the
    /// bucket clean.
    pub async fn add_post(&self, group: GroupId, hour: HourBucket, index: PostIndex) -> Result<bool, StoreError> {
        let post_id = index.post_id.clone();
        let added = self.inner.update(group, hour, |bucket| bucket.insert(index)).await?;
        trace!(group = %group, hour = %hour, post = %post_id, added = added, "add_post");
        Ok(added)
    }

    /// Bucket contents.
    pub async fn bucket(&self, group: GroupId, hour: HourBucket) -> Result<PostIndexBucket, StoreError> {
        Ok(self.inner.get(group, hour).await?.unwrap_or_default())
    }

    /// Underlying buffer.
    pub fn buffer(&self) -> &BufferedIndex<PostIndexBucket> {
        &self.inner
    }

    /// Flush dirty buckets.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryEphemeralStore;
    use crate::types::AccountId;
    use chrono::{Duration, TimeZone, Utc};

    fn index(id: &str) -> PostIndex {
        PostIndex {
            post_id: PostId::new(id),
            posted_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap(),
            posted_by: AccountId::activitypub("https://a.example/users/alice"),
            reposted_post_id: None,
        }
    }

    #[tokio::test]
    async fn test_readd_is_noop_and_clean() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let timing = BufferTiming {
            retention: Duration::days(3),
            staleness: Duration::minutes(10),
            read_timeout: std::time::Duration::from_secs(1),
            write_timeout: std::time::Duration::from_secs(1),
        };
        let buffer = PostIndexBuffer::new(Arc::new(InMemoryEphemeralStore::new(10)), clock.clone(), timing);
        let hour = HourBucket::containing(clock.now());

        assert!(buffer.add_post(GroupId(1), hour, index("p1")).await.unwrap());
        buffer.flush().await;
        assert_eq!(buffer.buffer().dirty_count(), 0);

        assert!(!buffer.add_post(GroupId(1), hour, index("p1")).await.unwrap());
        assert_eq!(buffer.buffer().dirty_count(), 0);
        assert_eq!(buffer.bucket(GroupId(1), hour).await.unwrap().len(), 1);
    }
}
