//! Merge, score, select, hydrate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clients::{call_with_timeout, PostContentStore};
use crate::config::ConfigError;
use crate::index::{local_hour, HourBucket, ReferenceBucket, ReferenceBuffer};
use crate::telemetry;
use crate::types::{GroupId, Post, PostId, ReferenceIndex, ScoredPost};
use super::scoring::ReferenceScorer;
use super::{RankingConfig, RankingError};

/// Buckets consulted when ranking at `now`, newest first.
pub fn lookback_buckets(now: DateTime<Utc>, config: &RankingConfig) -> Vec<HourBucket> {
    let current = HourBucket::containing(now);
    let mut buckets = vec![current, current.previous()];
    if local_hour(now, config.utc_offset_minutes) < config.early_morning_cutoff_hour {
        buckets.push(current.minus_hours(config.early_morning_lookback_hours));
    }
    buckets
}

/// Merge bucket aggregates per post: counts are summed, member detail lists
/// concatenated. Output is ordered by post id.
pub fn merge_buckets<'a>(buckets: impl IntoIterator<Item = &'a ReferenceBucket>) -> Vec<ReferenceIndex> {
    let mut merged: BTreeMap<PostId, ReferenceIndex> = BTreeMap::new();
    for bucket in buckets {
        for index in bucket.iter() {
            match merged.get_mut(&index.post_id) {
                Some(existing) => existing.merge(index),
                None => {
                    merged.insert(index.post_id.clone(), index.clone());
                }
            }
        }
    }
    merged.into_values().collect()
}

/// Score `merged` and keep the best `k`.
///
/// The sort is stable, so equal scores keep their input order.
pub fn select_top(merged: Vec<ReferenceIndex>, scorer: &dyn ReferenceScorer, k: usize) -> Vec<(f64, ReferenceIndex)> {
    let mut scored: Vec<(f64, ReferenceIndex)> = merged
        .into_iter()
        .map(|index| (scorer.score(&index), index))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(k);
    scored
}

/// Ranks a group's recently referenced posts.
pub struct RankingEngine {
    config: RankingConfig,
    references: Arc<ReferenceBuffer>,
    posts: Arc<dyn PostContentStore>,
    scorer: Arc<dyn ReferenceScorer>,
}

impl RankingEngine {
    /// Create an engine using the configured weighted scorer.
    pub fn new(
        config: RankingConfig,
        references: Arc<ReferenceBuffer>,
        posts: Arc<dyn PostContentStore>,
    ) -> Result<Self, ConfigError> {
        let scorer = Arc::new(config.scorer()?);
        Ok(Self { config, references, posts, scorer })
    }

    /// Replace the scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn ReferenceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Merged aggregates of the lookback window.
    pub async fn merged(&self, group: GroupId, now: DateTime<Utc>) -> Result<Vec<ReferenceIndex>, RankingError> {
        let mut buckets = Vec::new();
        for hour in lookback_buckets(now, &self.config) {
            buckets.push(self.references.bucket(group, hour).await?);
        }
        Ok(merge_buckets(&buckets))
    }

    /// Top posts of `group` at `now`, best first, with bodies resolved.
    ///
    /// Posts whose body cannot be found are left out.
    pub async fn ranked_posts(&self, group: GroupId, now: DateTime<Utc>) -> Result<Vec<ScoredPost>, RankingError> {
        let started = Instant::now();
        let buckets = lookback_buckets(now, &self.config).len();
        let merged = self.merged(group, now).await?;
        let candidates = merged.len();

        let top = select_top(merged, self.scorer.as_ref(), self.config.top_k);
        let ranked = self.hydrate(top).await?;

        telemetry::record_ranking(group, buckets, candidates, ranked.len(), started.elapsed().as_millis() as u64);
        Ok(ranked)
    }

    async fn hydrate(&self, top: Vec<(f64, ReferenceIndex)>) -> Result<Vec<ScoredPost>, RankingError> {
        if top.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = self.config.read_timeout();

        let ids: Vec<PostId> = top.iter().map(|(_, index)| index.post_id.clone()).collect();
        let mut bodies: HashMap<PostId, Post> = call_with_timeout(timeout, self.posts.get_many(&ids)).await?;

        let related: BTreeSet<PostId> = bodies
            .values()
            .flat_map(|post| post.related_ids())
            .filter(|id| !bodies.contains_key(*id))
            .cloned()
            .collect();
        if !related.is_empty() {
            let related: Vec<PostId> = related.into_iter().collect();
            bodies.extend(call_with_timeout(timeout, self.posts.get_many(&related)).await?);
        }

        let resolve = |id: &Option<PostId>| id.as_ref().and_then(|id| bodies.get(id)).cloned();
        let mut ranked = Vec::with_capacity(top.len());
        for (score, references) in top {
            let Some(post) = bodies.get(&references.post_id).cloned() else {
                debug!(post = %references.post_id, "Skipping ranked post with no body");
                continue;
            };
            ranked.push(ScoredPost {
                score,
                embedded: resolve(&post.embedded_post_id),
                parent: resolve(&post.parent_post_id),
                root: resolve(&post.root_post_id),
                post,
                references,
            });
        }
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::InMemoryPostStore;
    use crate::clock::{Clock, ManualClock};
    use crate::index::IndexConfig;
    use crate::store::{EphemeralStore, InMemoryEphemeralStore};
    use crate::types::{AccountId, ReferenceCounts};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, 30, 0).unwrap()
    }

    fn post(id: &str) -> Post {
        Post {
            id: PostId::new(id),
            author: AccountId::atproto("did:plc:author"),
            text: format!("post {}", id),
            posted_at: at(9),
            embedded_post_id: None,
            parent_post_id: None,
            root_post_id: None,
        }
    }

    struct Fixture {
        references: Arc<ReferenceBuffer>,
        posts: Arc<InMemoryPostStore>,
        engine: RankingEngine,
    }

    fn fixture(config: RankingConfig) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(12)));
        let store: Arc<dyn EphemeralStore> = Arc::new(InMemoryEphemeralStore::new(1_000));
        let references = Arc::new(ReferenceBuffer::new(store, clock, IndexConfig::default().timing()));
        let posts = Arc::new(InMemoryPostStore::new());
        let engine = RankingEngine::new(config, references.clone(), posts.clone()).unwrap();
        Fixture { references, posts, engine }
    }

    #[test]
    fn test_lookback_reaches_back_early_in_the_morning() {
        let config = RankingConfig::default();
        let noon = HourBucket::containing(at(12));
        assert_eq!(lookback_buckets(at(12), &config), vec![noon, noon.previous()]);

        let early = HourBucket::containing(at(3));
        assert_eq!(
            lookback_buckets(at(3), &config),
            vec![early, early.previous(), early.minus_hours(48)]
        );

        // 03:30 UTC is 12:30 at UTC+9.
        let tokyo = RankingConfig { utc_offset_minutes: 9 * 60, ..RankingConfig::default() };
        assert_eq!(lookback_buckets(at(3), &tokyo).len(), 2);
    }

    #[test]
    fn test_select_top_is_stable() {
        let scorer = crate::ranking::WeightedScorer::default();
        let merged: Vec<ReferenceIndex> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let mut index = ReferenceIndex::new(PostId::new(*id));
                index.member = ReferenceCounts { like: 1, ..Default::default() };
                index
            })
            .collect();

        let top = select_top(merged, &scorer, 2);
        let ids: Vec<&str> = top.iter().map(|(_, i)| i.post_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_merges_current_and_previous_hour() {
        let f = fixture(RankingConfig::default());
        let group = GroupId(1);
        let h = HourBucket::containing(at(12));
        let target = PostId::new("p");

        f.references.add_quote(group, h, &target, &PostId::new("q1"), true).await.unwrap();
        f.references.add_quote(group, h, &target, &PostId::new("q2"), true).await.unwrap();
        f.references.add_reply(group, h.previous(), &target, &PostId::new("r1"), true).await.unwrap();
        // Outside the window at noon.
        f.references.add_like(group, h.minus_hours(48), &target, &AccountId::atproto("did:plc:x"), true).await.unwrap();

        let merged = f.engine.merged(group, at(12)).await.unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].member, ReferenceCounts { quote: 2, reply: 1, repost: 0, like: 0 });
        assert_eq!(merged[0].quoted_by.len(), 2);
        assert_eq!(merged[0].replied_by, vec![PostId::new("r1")]);
    }

    #[tokio::test]
    async fn test_hydration_batches_and_skips_missing() {
        let f = fixture(RankingConfig::default());
        let group = GroupId(1);
        let h = HourBucket::containing(at(12));
        let actor = AccountId::atproto("did:plc:m");

        let mut reply = post("reply");
        reply.parent_post_id = Some(PostId::new("parent"));
        reply.root_post_id = Some(PostId::new("root"));
        f.posts.insert(reply);
        f.posts.insert(post("parent"));
        f.posts.insert(post("root"));

        f.references.add_repost(group, h, &PostId::new("reply"), &actor, true).await.unwrap();
        f.references.add_repost(group, h, &PostId::new("gone"), &actor, true).await.unwrap();
        f.references.add_like(group, h, &PostId::new("gone"), &actor, true).await.unwrap();

        let ranked = f.engine.ranked_posts(group, at(12)).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].post.id, PostId::new("reply"));
        assert_eq!(ranked[0].parent.as_ref().map(|p| p.id.as_str()), Some("parent"));
        assert_eq!(ranked[0].root.as_ref().map(|p| p.id.as_str()), Some("root"));
        assert!(ranked[0].embedded.is_none());

        let batches = f.posts.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![PostId::new("gone"), PostId::new("reply")]);
        assert_eq!(batches[1], vec![PostId::new("parent"), PostId::new("root")]);
    }

    #[tokio::test]
    async fn test_empty_window_skips_lookups() {
        let f = fixture(RankingConfig::default());
        assert!(f.engine.ranked_posts(GroupId(9), at(12)).await.unwrap().is_empty());
        assert!(f.posts.batches().is_empty());
    }
}
