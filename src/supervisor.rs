//! The explicit context that owns every component and drives the periodic
//! tasks.
//!
//! ## Periodic tasks
//!
//! | Task      | Period                     | Work                                 |
//! |-----------|----------------------------|--------------------------------------|
//! | scheduler | `crawl.scheduler_interval` | start the next crawl if idle         |
//! | crawl     | `crawl.crawl_interval`     | process one batch of the active crawl|
//! | flush     | `index.flush_interval`     | flush dirty buckets, evict idle ones |
//! | sweep     | `index.sweep_interval`     | delete expired ephemeral rows        |
//!
//! A tick that fails or panics is logged; the loop keeps running.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clients::{GroupRegistry, NetworkClients, PostContentStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, KernelConfig};
use crate::crawl::{AccountRepository, CrawlError, CrawlRecords, CrawlStatus, CrawlTick, CrawlWorker, FollowListRepository, SchedulerTick};
use crate::index::{FlushReport, HourBucket, PostIndexBuffer, ReferenceBuffer};
use crate::ranking::{RankingEngine, RankingError};
use crate::store::{read_with_timeout, write_with_timeout, DurableStore, EphemeralStore, StoreError};
use crate::telemetry;
use crate::types::{
    AccountId, CrawlResult, FollowList, GroupId, MembershipChange, Neighbors, PostId, PostIndex, ScoredPost,
};

/// Error type for supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Storage failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Crawl failure.
    #[error("Crawl error: {0}")]
    Crawl(#[from] CrawlError),
    /// Ranking failure.
    #[error("Ranking error: {0}")]
    Ranking(#[from] RankingError),
    /// Administrative deletes need a non-empty prefix.
    #[error("Refusing to delete with an empty key prefix")]
    EmptyPrefix,
}

/// External collaborators handed to [`Supervisor::new`].
pub struct Collaborators {
    /// TTL-bounded storage for caches and index buckets.
    pub ephemeral: Arc<dyn EphemeralStore>,
    /// Non-expiring storage for crawl results and neighbor sets.
    pub durable: Arc<dyn DurableStore>,
    /// Protocol clients by network family.
    pub clients: NetworkClients,
    /// Post bodies for ranking.
    pub posts: Arc<dyn PostContentStore>,
    /// Groups and their members.
    pub groups: Arc<dyn GroupRegistry>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators on the wall clock.
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        clients: NetworkClients,
        posts: Arc<dyn PostContentStore>,
        groups: Arc<dyn GroupRegistry>,
    ) -> Self {
        Self { ephemeral, durable, clients, posts, groups, clock: Arc::new(SystemClock) }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Owns the crawl worker, caches, buffers and ranking engine.
pub struct Supervisor {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    ephemeral: Arc<dyn EphemeralStore>,
    accounts: Arc<AccountRepository>,
    follows: Arc<FollowListRepository>,
    records: Arc<CrawlRecords>,
    worker: CrawlWorker,
    post_index: PostIndexBuffer,
    references: Arc<ReferenceBuffer>,
    ranking: RankingEngine,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Validate `config`, load long-lived records and wire every component.
    pub async fn new(config: KernelConfig, collaborators: Collaborators) -> Result<Self, SupervisorError> {
        config.validate()?;
        let Collaborators { ephemeral, durable, clients, posts, groups, clock } = collaborators;

        let accounts = Arc::new(AccountRepository::new(
            ephemeral.clone(),
            &config.cache,
            clients.clone(),
            &config.crawl,
            clock.clone(),
        ));
        let follows = Arc::new(FollowListRepository::new(
            ephemeral.clone(),
            &config.cache,
            accounts.clone(),
            clients,
            &config.crawl,
            clock.clone(),
        ));
        let records = Arc::new(CrawlRecords::load(durable, config.crawl.read_timeout(), config.crawl.write_timeout()).await?);
        let worker = CrawlWorker::new(config.crawl.clone(), groups, follows.clone(), records.clone(), clock.clone());

        let timing = config.index.timing();
        let post_index = PostIndexBuffer::new(ephemeral.clone(), clock.clone(), timing);
        let references = Arc::new(ReferenceBuffer::new(ephemeral.clone(), clock.clone(), timing));
        let ranking = RankingEngine::new(config.ranking.clone(), references.clone(), posts)?;

        info!(
            crawled_groups = records.crawled_groups().len(),
            max_neighbors = config.crawl.max_neighbors,
            top_k = config.ranking.top_k,
            "Supervisor ready"
        );

        Ok(Self {
            config,
            clock,
            ephemeral,
            accounts,
            follows,
            records,
            worker,
            post_index,
            references,
            ranking,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The crawl worker, for driving ticks by hand.
    pub fn worker(&self) -> &CrawlWorker {
        &self.worker
    }

    /// Current time on the supervisor's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether the periodic tasks have been started.
    pub fn workers_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // ─── Periodic tasks ───────────────────────────────────────────────

    /// Spawn the periodic tasks. Only the first call spawns; later calls
    /// return `false`.
    pub fn start_workers(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let scheduler = Arc::clone(self);
        let crawl = Arc::clone(self);
        let flush = Arc::clone(self);
        let sweep = Arc::clone(self);

        let handles = vec![
            spawn_periodic("scheduler", self.config.crawl.scheduler_interval(), move || {
                let s = Arc::clone(&scheduler);
                async move { s.run_scheduler_tick().await }
            }),
            spawn_periodic("crawl", self.config.crawl.crawl_interval(), move || {
                let s = Arc::clone(&crawl);
                async move { s.run_crawl_tick().await }
            }),
            spawn_periodic("flush", self.config.index.flush_interval(), move || {
                let s = Arc::clone(&flush);
                async move {
                    s.flush_indices().await;
                    s.evict_idle_buckets();
                    Ok::<(), SupervisorError>(())
                }
            }),
            spawn_periodic("sweep", self.config.index.sweep_interval(), move || {
                let s = Arc::clone(&sweep);
                async move { s.delete_expired_ephemeral_data(s.clock.now()).await.map(|_| ()) }
            }),
        ];
        *self.tasks.lock() = handles;
        info!("Periodic tasks started");
        true
    }

    /// Stop the periodic tasks and flush the index buffers.
    pub async fn shutdown(&self) -> FlushReport {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in &handles {
            handle.abort();
        }
        let report = self.flush_indices().await;
        info!(tasks = handles.len(), flushed = report.flushed, failed = report.failed, "Supervisor stopped");
        report
    }

    async fn run_scheduler_tick(&self) -> Result<(), SupervisorError> {
        match self.worker.scheduler_tick().await? {
            SchedulerTick::Started { group, crawl_id, reason } => {
                debug!(group = %group, crawl_id = %crawl_id, reason = %reason, "Scheduler started a crawl");
            }
            SchedulerTick::Busy | SchedulerTick::Idle => {}
        }
        Ok(())
    }

    async fn run_crawl_tick(&self) -> Result<(), SupervisorError> {
        if let CrawlTick::Finished(result) = self.worker.crawl_tick().await? {
            debug!(group = %result.group_id, success = result.success, "Crawl tick finished a crawl");
        }
        Ok(())
    }

    fn evict_idle_buckets(&self) {
        let evicted = self.post_index.buffer().evict_idle() + self.references.buffer().evict_idle();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle index buckets");
        }
    }

    // ─── Observability ────────────────────────────────────────────────

    /// Neighbors from the last successful crawl of `group`.
    pub fn get_neighbors(&self, group: GroupId) -> Option<Neighbors> {
        self.records.neighbors(group)
    }

    /// Last crawl result of `group`.
    pub fn get_crawl_result(&self, group: GroupId) -> Option<CrawlResult> {
        self.records.result(group)
    }

    /// Groups with a crawl result on record.
    pub fn crawled_groups(&self) -> Vec<GroupId> {
        self.records.crawled_groups()
    }

    /// Rows currently held by the ephemeral store.
    pub async fn ephemeral_row_count(&self) -> Result<u64, SupervisorError> {
        let timing = self.config.index.timing();
        Ok(read_with_timeout(timing.read_timeout, self.ephemeral.row_count()).await?)
    }

    /// Snapshot of the active crawl.
    pub fn get_crawl_status(&self) -> Option<CrawlStatus> {
        self.worker.status()
    }

    /// Top referenced posts of `group` at `now`.
    pub async fn get_ranked_posts(&self, group: GroupId, now: DateTime<Utc>) -> Result<Vec<ScoredPost>, SupervisorError> {
        Ok(self.ranking.ranked_posts(group, now).await?)
    }

    // ─── Ingestion ────────────────────────────────────────────────────

    /// Record a post appearing in the group's timeline.
    pub async fn add_post(&self, group: GroupId, hour: HourBucket, index: PostIndex) -> Result<bool, SupervisorError> {
        Ok(self.post_index.add_post(group, hour, index).await?)
    }

    /// Record `source` quoting `target`.
    pub async fn add_quote(&self, group: GroupId, hour: HourBucket, target: &PostId, source: &PostId, by_member: bool) -> Result<bool, SupervisorError> {
        Ok(self.references.add_quote(group, hour, target, source, by_member).await?)
    }

    /// Record `source` replying to `target`.
    pub async fn add_reply(&self, group: GroupId, hour: HourBucket, target: &PostId, source: &PostId, by_member: bool) -> Result<bool, SupervisorError> {
        Ok(self.references.add_reply(group, hour, target, source, by_member).await?)
    }

    /// Record `actor` reposting `target`.
    pub async fn add_repost(&self, group: GroupId, hour: HourBucket, target: &PostId, actor: &AccountId, by_member: bool) -> Result<bool, SupervisorError> {
        Ok(self.references.add_repost(group, hour, target, actor, by_member).await?)
    }

    /// Record `actor` liking `target`.
    pub async fn add_like(&self, group: GroupId, hour: HourBucket, target: &PostId, actor: &AccountId, by_member: bool) -> Result<bool, SupervisorError> {
        Ok(self.references.add_like(group, hour, target, actor, by_member).await?)
    }

    /// Posts indexed for `group` during `hour`.
    pub async fn get_post_index(&self, group: GroupId, hour: HourBucket) -> Result<Vec<PostIndex>, SupervisorError> {
        Ok(self.post_index.bucket(group, hour).await?.iter().cloned().collect())
    }

    // ─── Accounts ─────────────────────────────────────────────────────

    /// Resolve a user-entered handle.
    pub async fn resolve_handle(&self, handle: &str) -> Result<Option<AccountId>, SupervisorError> {
        Ok(self.accounts.resolve_handle(handle).await?)
    }

    /// Complete follow list of `account`, from cache or fetched now.
    pub async fn fetch_follow_list(&self, account: &AccountId) -> Result<Option<FollowList>, SupervisorError> {
        Ok(self.follows.fetch_all(account).await?)
    }

    /// Report a membership change from the group-editing layer.
    ///
    /// Additions and removals invalidate the group's last result so the
    /// scheduler re-crawls it. Returns whether anything was invalidated.
    pub async fn note_membership_change(&self, group: GroupId, change: MembershipChange) -> Result<bool, SupervisorError> {
        if !change.alters_membership() {
            debug!(group = %group, "Membership unchanged");
            return Ok(false);
        }
        info!(group = %group, change = ?change, "Membership changed");
        let during_crawl = self.worker.note_membership_change(group);
        let on_record = self.records.invalidate(group).await?;
        Ok(during_crawl || on_record)
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Delete every ephemeral row whose key starts with `prefix`, along with
    /// matching buffered buckets and cache entries.
    ///
    /// This is the only operation that discards unflushed index writes.
    pub async fn delete_ephemeral_indices(&self, prefix: &str) -> Result<u64, SupervisorError> {
        if prefix.is_empty() {
            return Err(SupervisorError::EmptyPrefix);
        }
        let dropped = self.post_index.buffer().drop_prefix(prefix) + self.references.buffer().drop_prefix(prefix);
        let evicted =
            self.accounts.cache().evict_cached_prefix(prefix) + self.follows.cache().evict_cached_prefix(prefix);
        let write_timeout = self.config.index.timing().write_timeout;
        let deleted = write_with_timeout(write_timeout, self.ephemeral.delete_prefix(prefix)).await?;

        warn!(
            prefix = prefix,
            deleted = deleted,
            dropped_buckets = dropped,
            evicted_cache_entries = evicted,
            "Deleted ephemeral data by prefix"
        );
        Ok(deleted)
    }

    /// Delete every ephemeral row expired at `now`.
    pub async fn delete_expired_ephemeral_data(&self, now: DateTime<Utc>) -> Result<u64, SupervisorError> {
        let write_timeout = self.config.index.timing().write_timeout;
        let removed = write_with_timeout(write_timeout, self.ephemeral.delete_expired(now)).await?;
        telemetry::record_sweep(removed);
        Ok(removed)
    }

    /// Flush both index buffers now.
    pub async fn flush_indices(&self) -> FlushReport {
        let posts = self.post_index.flush().await;
        telemetry::record_flush(self.post_index.buffer().table(), &posts);
        let references = self.references.flush().await;
        telemetry::record_flush(self.references.buffer().table(), &references);

        FlushReport {
            flushed: posts.flushed + references.flushed,
            failed: posts.failed + references.failed,
            raced: posts.raced + references.raced,
        }
    }
}

fn spawn_periodic<F, Fut, E>(task: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match AssertUnwindSafe(tick()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = task, error = %e, "Periodic task failed"),
                Err(_) => error!(task = task, "Periodic task panicked"),
            }
        }
    })
}
