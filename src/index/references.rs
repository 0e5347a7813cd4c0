//! Reference (interaction) count buckets.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::Clock;
use crate::store::keys::REFERENCE_INDEX_PREFIX;
use crate::store::{EphemeralStore, StoreError};
use crate::types::{AccountId, GroupId, PostId, ReferenceIndex, ReferenceKind};
use super::bucket::HourBucket;
use super::buffer::{BufferTiming, BufferedIndex, FlushReport};

/// Reference aggregates for one (group, hour), keyed by referenced post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBucket {
    references: BTreeMap<PostId, ReferenceIndex>,
}

impl ReferenceBucket {
    /// Count a reference to `target`.
    ///
    /// Member-originated quotes and replies keep the referring post id,
    /// member reposts keep the actor. Recording the same member detail twice
    /// is a no-op; neighbor references are counted only and cannot be
    /// deduplicated.
    pub fn record(
        &mut self,
        target: &PostId,
        kind: ReferenceKind,
        source: ReferenceSource<'_>,
        by_member: bool,
    ) -> bool {
        let entry = self
            .references
            .entry(target.clone())
            .or_insert_with(|| ReferenceIndex::new(target.clone()));

        if !by_member {
            entry.neighbor.bump(kind);
            return true;
        }

        let added = match (kind, source) {
            (ReferenceKind::Quote, ReferenceSource::Post(post)) => entry.add_quote(post),
            (ReferenceKind::Reply, ReferenceSource::Post(post)) => entry.add_reply(post),
            (ReferenceKind::Repost, ReferenceSource::Account(actor)) => entry.add_repost(actor),
            _ => true,
        };
        if !added {
            return false;
        }
        entry.member.bump(kind);
        true
    }

    /// Aggregate for `post_id`.
    pub fn get(&self, post_id: &PostId) -> Option<&ReferenceIndex> {
        self.references.get(post_id)
    }

    /// Aggregates ordered by post id.
    pub fn iter(&self) -> impl Iterator<Item = &ReferenceIndex> {
        self.references.values()
    }

    /// Number of referenced posts.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// What a reference came from.
#[derive(Debug, Clone, Copy)]
pub enum ReferenceSource<'a> {
    /// The referring post (quotes, replies).
    Post(&'a PostId),
    /// The acting account (reposts, likes).
    Account(&'a AccountId),
}

/// Buffered reference index, one bucket per (group, hour).
pub struct ReferenceBuffer {
    inner: BufferedIndex<ReferenceBucket>,
}

impl ReferenceBuffer {
    /// Create a buffer over `store`.
    pub fn new(store: Arc<dyn EphemeralStore>, clock: Arc<dyn Clock>, timing: BufferTiming) -> Self {
        Self { inner: BufferedIndex::new(REFERENCE_INDEX_PREFIX, store, clock, timing) }
    }

    async fn record(
        &self,
        group: GroupId,
        hour: HourBucket,
        target: &PostId,
        kind: ReferenceKind,
        source: ReferenceSource<'_>,
        by_member: bool,
    ) -> Result<bool, StoreError> {
        let changed = self
            .inner
            .update(group, hour, |bucket| bucket.record(target, kind, source, by_member))
            .await?;
        trace!(group = %group, hour = %hour, target = %target, kind = %kind, by_member = by_member, "reference");
        Ok(changed)
    }

    /// `source` quoted `target`.
    pub async fn add_quote(&self, group: GroupId, hour: HourBucket, target: &PostId, source: &PostId, by_member: bool) -> Result<bool, StoreError> {
        self.record(group, hour, target, ReferenceKind::Quote, ReferenceSource::Post(source), by_member).await
    }

    /// `source` replied to `target`.
    pub async fn add_reply(&self, group: GroupId, hour: HourBucket, target: &PostId, source: &PostId, by_member: bool) -> Result<bool, StoreError> {
        self.record(group, hour, target, ReferenceKind::Reply, ReferenceSource::Post(source), by_member).await
    }

    /// `actor` reposted `target`.
    pub async fn add_repost(&self, group: GroupId, hour: HourBucket, target: &PostId, actor: &AccountId, by_member: bool) -> Result<bool, StoreError> {
        self.record(group, hour, target, ReferenceKind::Repost, ReferenceSource::Account(actor), by_member).await
    }

    /// `actor` liked `target`. Counted only.
    pub async fn add_like(&self, group: GroupId, hour: HourBucket, target: &PostId, actor: &AccountId, by_member: bool) -> Result<bool, StoreError> {
        self.record(group, hour, target, ReferenceKind::Like, ReferenceSource::Account(actor), by_member).await
    }

    /// Bucket contents.
    pub async fn bucket(&self, group: GroupId, hour: HourBucket) -> Result<ReferenceBucket, StoreError> {
        Ok(self.inner.get(group, hour).await?.unwrap_or_default())
    }

    /// Underlying buffer.
    pub fn buffer(&self) -> &BufferedIndex<ReferenceBucket> {
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

    #[test]
    fn test_member_detail_is_kept_and_deduplicated() {
        let mut bucket = ReferenceBucket::default();
        let target = PostId::new("p");
        let quote = PostId::new("q1");

        assert!(bucket.record(&target, ReferenceKind::Quote, ReferenceSource::Post(&quote), true));
        assert!(!bucket.record(&target, ReferenceKind::Quote, ReferenceSource::Post(&quote), true));

        let entry = bucket.get(&target).unwrap();
        assert_eq!(entry.member.quote, 1);
        assert_eq!(entry.quoted_by, vec![quote]);
    }

    #[test]
    fn test_neighbor_references_are_count_only() {
        let mut bucket = ReferenceBucket::default();
        let target = PostId::new("p");
        let reply = PostId::new("r1");
        let actor = AccountId::atproto("did:plc:n");

        bucket.record(&target, ReferenceKind::Reply, ReferenceSource::Post(&reply), false);
        bucket.record(&target, ReferenceKind::Reply, ReferenceSource::Post(&reply), false);
        bucket.record(&target, ReferenceKind::Repost, ReferenceSource::Account(&actor), false);

        let entry = bucket.get(&target).unwrap();
        assert_eq!(entry.neighbor.reply, 2);
        assert_eq!(entry.neighbor.repost, 1);
        assert!(entry.replied_by.is_empty());
        assert!(entry.reposted_by.is_empty());
    }

    #[test]
    fn test_member_likes_count_without_detail() {
        let mut bucket = ReferenceBucket::default();
        let target = PostId::new("p");
        let actor = AccountId::atproto("did:plc:m");

        bucket.record(&target, ReferenceKind::Like, ReferenceSource::Account(&actor), true);
        bucket.record(&target, ReferenceKind::Like, ReferenceSource::Account(&actor), true);

        let entry = bucket.get(&target).unwrap();
        assert_eq!(entry.member.like, 2);
        assert_eq!(entry.member.total(), 2);
    }
}
