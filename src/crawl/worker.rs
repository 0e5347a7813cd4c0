//! The crawl worker: scheduler tick and crawl tick.
//!
//! Both ticks are driven externally (the supervisor spawns the loops); tests
//! call them directly. Shared state lives in one `parking_lot` mutex that is
//! only locked between suspension points.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::{call_with_timeout, GroupRegistry};
use crate::clock::Clock;
use crate::collections::BoundedQueue;
use crate::telemetry;
use crate::types::{member_fingerprint, AccountId, CrawlResult, FollowList, FollowPage, GroupId, Neighbors};
use super::config::CrawlConfig;
use super::policy::{crawl_decision, CrawlDecision, StartReason};
use super::repository::{CrawlRecords, FollowListRepository, PageFetch};
use super::status::{CrawlPhase, CrawlStatus, FollowsFetchRequest};
use super::CrawlError;

/// What a scheduler tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerTick {
    /// A crawl is already active.
    Busy,
    /// No group needs a crawl.
    Idle,
    /// A crawl was started and seeded.
    Started {
        /// Group being crawled.
        group: GroupId,
        /// Id of the new crawl.
        crawl_id: Uuid,
        /// Why it started.
        reason: StartReason,
    },
}

/// What a crawl tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTick {
    /// No crawl is ready for work.
    Idle,
    /// Another crawl tick is still running.
    Busy,
    /// A batch was processed.
    Progress {
        /// Requests processed.
        processed: usize,
        /// Follow lists folded into the counts.
        folded: usize,
        /// Accounts marked errored.
        errored: usize,
    },
    /// The crawl reached a terminal state and its result was written.
    Finished(CrawlResult),
}

struct ActiveCrawl {
    status: CrawlStatus,
    queue: BoundedQueue<FollowsFetchRequest>,
    /// Pages fetched so far of follow lists still being paged.
    partial: HashMap<AccountId, Vec<AccountId>>,
    /// Requests taken by a crawl tick whose outcomes are not applied yet.
    /// Non-empty at plan time only if the previous tick was dropped.
    in_flight: Vec<FollowsFetchRequest>,
    /// A membership change was reported while this crawl ran.
    invalidated: bool,
}

enum Plan {
    Idle,
    Batch {
        crawl_id: Uuid,
        group: GroupId,
        requests: Vec<FollowsFetchRequest>,
    },
    Finalize {
        crawl_id: Uuid,
        success: bool,
    },
}

enum FetchOutcome {
    Cached(FollowList),
    Page(FollowPage),
    NotFound,
    Failed(String),
}

#[derive(Default)]
struct Applied {
    processed: usize,
    folded: usize,
    errored: usize,
    to_commit: Vec<FollowList>,
    finalize: Option<bool>,
}

/// Runs at most one crawl at a time.
pub struct CrawlWorker {
    config: CrawlConfig,
    registry: Arc<dyn GroupRegistry>,
    follows: Arc<FollowListRepository>,
    records: Arc<CrawlRecords>,
    clock: Arc<dyn Clock>,
    active: Mutex<Option<ActiveCrawl>>,
    ticking: tokio::sync::Mutex<()>,
}

impl CrawlWorker {
    /// Create an idle worker.
    pub fn new(
        config: CrawlConfig,
        registry: Arc<dyn GroupRegistry>,
        follows: Arc<FollowListRepository>,
        records: Arc<CrawlRecords>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            follows,
            records,
            clock,
            active: Mutex::new(None),
            ticking: tokio::sync::Mutex::new(()),
        }
    }

    /// Worker configuration.
    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Snapshot of the active crawl, if any.
    pub fn status(&self) -> Option<CrawlStatus> {
        self.active.lock().as_ref().map(|active| active.status.clone())
    }

    /// Whether a crawl is active.
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Record that `group` changed membership while it may be crawling.
    ///
    /// The active crawl's result is then written pre-invalidated. Returns
    /// whether `group` is the one being crawled.
    pub fn note_membership_change(&self, group: GroupId) -> bool {
        match self.active.lock().as_mut() {
            Some(active) if active.status.group_id == group => {
                active.invalidated = true;
                true
            }
            _ => false,
        }
    }

    /// Start a crawl of the first group (by id) that needs one.
    pub async fn scheduler_tick(&self) -> Result<SchedulerTick, CrawlError> {
        if self.is_active() {
            return Ok(SchedulerTick::Busy);
        }

        let mut groups = call_with_timeout(self.config.read_timeout(), self.registry.get_all()).await?;
        groups.sort_by_key(|g| g.id);

        let now = self.clock.now();
        let chosen = groups.into_iter().find_map(|group| {
            let previous = self.records.result(group.id);
            match crawl_decision(previous.as_ref(), &group, now, &self.config) {
                CrawlDecision::Start(reason) => Some((group, reason)),
                CrawlDecision::Skip => None,
            }
        });
        let Some((group, reason)) = chosen else {
            return Ok(SchedulerTick::Idle);
        };

        let crawl_id = Uuid::new_v4();
        {
            let mut slot = self.active.lock();
            if slot.is_some() {
                return Ok(SchedulerTick::Busy);
            }
            *slot = Some(ActiveCrawl {
                status: CrawlStatus::new(crawl_id, group.id, group.members.clone(), now),
                queue: BoundedQueue::new(self.config.queue_capacity),
                partial: HashMap::new(),
                in_flight: Vec::new(),
                invalidated: false,
            });
        }
        // Releases the slot if seeding is abandoned by a panic or a drop.
        let _seeding = SeedingGuard { active: &self.active, crawl_id };
        info!(
            group = %group.id,
            crawl_id = %crawl_id,
            reason = %reason,
            members = group.members.len(),
            "Starting crawl"
        );

        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for member in &group.members {
            match self.follows.cached(member).await {
                Ok(Some(list)) => cached.push(list),
                Ok(None) => missing.push(member.clone()),
                Err(e) => {
                    warn!(account = %member, error = %e, "Follow list cache read failed; fetching");
                    missing.push(member.clone());
                }
            }
        }

        let mut slot = self.active.lock();
        let Some(active) = slot.as_mut().filter(|a| a.status.crawl_id == crawl_id) else {
            return Err(CrawlError::Superseded(crawl_id));
        };
        for list in &cached {
            active.status.fold(list);
        }
        for member in missing {
            if !active.queue.enqueue(FollowsFetchRequest::first(member.clone())) {
                warn!(account = %member, "Crawl queue full; marking member errored");
                active.status.mark_errored(&member);
            }
        }
        active.status.phase = CrawlPhase::Fetching;
        debug!(
            crawl_id = %crawl_id,
            seeded_from_cache = cached.len(),
            queued = active.queue.len(),
            "Seeded crawl"
        );

        Ok(SchedulerTick::Started { group: group.id, crawl_id, reason })
    }

    /// Process one batch of the active crawl.
    pub async fn crawl_tick(&self) -> Result<CrawlTick, CrawlError> {
        let Ok(_ticking) = self.ticking.try_lock() else {
            return Ok(CrawlTick::Busy);
        };
        let started = Instant::now();

        let plan = match self.active.lock().as_mut() {
            None => Plan::Idle,
            Some(active) => self.plan(active),
        };
        let (crawl_id, group, requests) = match plan {
            Plan::Idle => return Ok(CrawlTick::Idle),
            Plan::Finalize { crawl_id, success } => {
                return self.finalize(crawl_id, success).await.map(CrawlTick::Finished);
            }
            Plan::Batch { crawl_id, group, requests } => (crawl_id, group, requests),
        };

        let outcomes = join_all(requests.iter().map(|request| {
            async move {
                match AssertUnwindSafe(self.fetch_step(request)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(account = %request.account, "Follow fetch panicked");
                        FetchOutcome::Failed("fetch panicked".to_string())
                    }
                }
            }
        }))
        .await;
        let now = self.clock.now();

        let applied = match self.active.lock().as_mut() {
            Some(active) if active.status.crawl_id == crawl_id => {
                self.apply(active, requests.into_iter().zip(outcomes), now)
            }
            _ => {
                debug!(crawl_id = %crawl_id, "Discarding batch of a replaced crawl");
                return Ok(CrawlTick::Idle);
            }
        };

        for list in &applied.to_commit {
            if let Err(e) = self.follows.commit(list).await {
                warn!(account = %list.account, error = %e, "Failed to cache follow list");
            }
        }

        telemetry::record_crawl_tick(
            group,
            applied.processed,
            applied.folded,
            applied.errored,
            started.elapsed().as_millis() as u64,
        );

        if let Some(success) = applied.finalize {
            return self.finalize(crawl_id, success).await.map(CrawlTick::Finished);
        }
        Ok(CrawlTick::Progress {
            processed: applied.processed,
            folded: applied.folded,
            errored: applied.errored,
        })
    }

    fn plan(&self, active: &mut ActiveCrawl) -> Plan {
        let crawl_id = active.status.crawl_id;
        match active.status.phase {
            CrawlPhase::Seeding => return Plan::Idle,
            CrawlPhase::Finalizing { success } => return Plan::Finalize { crawl_id, success },
            CrawlPhase::Fetching => {}
        }

        self.recover_in_flight(active);
        if active.queue.is_empty() && !active.partial.is_empty() {
            // Paging stopped without a queued continuation.
            for account in std::mem::take(&mut active.partial).into_keys() {
                warn!(account = %account, "Follow list paging lost; marking account errored");
                active.status.mark_errored(&account);
            }
        }
        if active.status.error_limit_exceeded(self.config.max_error_ratio) {
            warn!(crawl_id = %crawl_id, errors = active.status.error_ids.len(), "Too many errors; aborting crawl");
            active.status.phase = CrawlPhase::Finalizing { success: false };
            return Plan::Finalize { crawl_id, success: false };
        }

        if active.queue.is_empty() && !self.expand(active) {
            active.status.phase = CrawlPhase::Finalizing { success: true };
            return Plan::Finalize { crawl_id, success: true };
        }

        let mut requests = Vec::with_capacity(self.config.batch_size);
        while requests.len() < self.config.batch_size {
            match active.queue.dequeue() {
                Some(request) => requests.push(request),
                None => break,
            }
        }
        active.in_flight = requests.clone();
        Plan::Batch { crawl_id, group: active.status.group_id, requests }
    }

    /// Requeue the batch of a tick that never applied its outcomes. Each
    /// counts as one failed attempt.
    fn recover_in_flight(&self, active: &mut ActiveCrawl) {
        for request in std::mem::take(&mut active.in_flight) {
            let retried = request.retried();
            if retried.errors < self.config.max_fetch_retries && active.queue.enqueue(retried) {
                warn!(account = %request.account, "Requeued fetch of an interrupted crawl tick");
            } else {
                warn!(account = %request.account, "Fetch of an interrupted crawl tick given up");
                active.partial.remove(&request.account);
                active.status.mark_errored(&request.account);
            }
        }
    }

    /// Promote the best candidate. Returns `false` when the crawl is done.
    fn expand(&self, active: &mut ActiveCrawl) -> bool {
        if active.status.actor_count() >= self.config.enough_actors {
            debug!(crawl_id = %active.status.crawl_id, "Enough actors; finalizing");
            return false;
        }
        let Some(candidate) = active.status.best_candidate() else {
            debug!(crawl_id = %active.status.crawl_id, "No candidates left; finalizing");
            return false;
        };

        active.status.promote(&candidate);
        debug!(
            crawl_id = %active.status.crawl_id,
            account = %candidate,
            close = active.status.close_ids.len(),
            "Promoted close neighbor"
        );
        if !active.queue.enqueue(FollowsFetchRequest::first(candidate.clone())) {
            warn!(account = %candidate, "Crawl queue full; marking neighbor errored");
            active.status.mark_errored(&candidate);
        }
        true
    }

    async fn fetch_step(&self, request: &FollowsFetchRequest) -> FetchOutcome {
        if request.cursor.is_none() {
            match self.follows.cached(&request.account).await {
                Ok(Some(list)) => return FetchOutcome::Cached(list),
                Ok(None) => {}
                Err(e) => warn!(account = %request.account, error = %e, "Follow list cache read failed"),
            }
        }

        match self.follows.fetch_page(request).await {
            Ok(PageFetch::Page(page)) => {
                debug!(
                    account = %request.account,
                    followed = page.followed.len(),
                    last = page.next.is_none(),
                    "Fetched follow page"
                );
                FetchOutcome::Page(page)
            }
            Ok(PageFetch::NotFound) => FetchOutcome::NotFound,
            Ok(PageFetch::Unavailable) => FetchOutcome::Failed("page unavailable".to_string()),
            Err(e) => FetchOutcome::Failed(e.to_string()),
        }
    }

    fn apply(
        &self,
        active: &mut ActiveCrawl,
        results: impl Iterator<Item = (FollowsFetchRequest, FetchOutcome)>,
        now: DateTime<Utc>,
    ) -> Applied {
        let mut applied = Applied::default();
        active.in_flight.clear();

        for (request, outcome) in results {
            applied.processed += 1;
            let account = request.account.clone();
            match outcome {
                FetchOutcome::Cached(list) => {
                    active.status.fold(&list);
                    applied.folded += 1;
                }
                FetchOutcome::Page(page) => match page.next {
                    Some(cursor) => {
                        active.partial.entry(account.clone()).or_default().extend(page.followed);
                        if !active.queue.enqueue(request.next_page(cursor)) {
                            warn!(account = %account, "Crawl queue full; dropping partial follow list");
                            active.partial.remove(&account);
                            active.status.mark_errored(&account);
                            applied.errored += 1;
                        }
                    }
                    None => {
                        let mut follows = active.partial.remove(&account).unwrap_or_default();
                        follows.extend(page.followed);
                        let list = FollowList::new(account, follows, now);
                        active.status.fold(&list);
                        applied.folded += 1;
                        applied.to_commit.push(list);
                    }
                },
                FetchOutcome::NotFound => {
                    debug!(account = %account, "Account or follow list not found");
                    active.partial.remove(&account);
                    active.status.mark_errored(&account);
                    applied.errored += 1;
                }
                FetchOutcome::Failed(reason) => {
                    let retried = request.retried();
                    let attempts = retried.errors;
                    if attempts < self.config.max_fetch_retries && active.queue.enqueue(retried) {
                        warn!(account = %account, attempts = attempts, reason = %reason, "Follow fetch failed; retrying");
                    } else {
                        warn!(account = %account, attempts = attempts, reason = %reason, "Follow fetch failed; giving up");
                        active.partial.remove(&account);
                        active.status.mark_errored(&account);
                        applied.errored += 1;
                    }
                }
            }
        }

        if active.status.error_limit_exceeded(self.config.max_error_ratio) {
            warn!(
                crawl_id = %active.status.crawl_id,
                errors = active.status.error_ids.len(),
                members = active.status.member_ids.len(),
                close = active.status.close_ids.len(),
                "Too many errors; aborting crawl"
            );
            active.status.phase = CrawlPhase::Finalizing { success: false };
            applied.finalize = Some(false);
        }
        applied
    }

    async fn finalize(&self, crawl_id: Uuid, success: bool) -> Result<CrawlResult, CrawlError> {
        let (status, invalidated) = match self.active.lock().as_ref() {
            Some(active) if active.status.crawl_id == crawl_id => (active.status.clone(), active.invalidated),
            _ => return Err(CrawlError::Superseded(crawl_id)),
        };

        let written = self.persist(&status, success, invalidated).await;
        self.release(crawl_id);
        let result = written?;

        telemetry::record_crawl_outcome(
            result.group_id,
            result.success,
            result.close_count as usize,
            result.far_count as usize,
            result.error_count as usize,
            (result.finished_at - result.started_at).num_seconds(),
        );
        info!(
            group = %result.group_id,
            crawl_id = %crawl_id,
            success = result.success,
            close = result.close_count,
            far = result.far_count,
            errors = result.error_count,
            lists_folded = status.lists_folded,
            "Crawl finished"
        );
        Ok(result)
    }

    async fn persist(&self, status: &CrawlStatus, success: bool, invalidated: bool) -> Result<CrawlResult, CrawlError> {
        let now = self.clock.now();
        let (close, far) = if success {
            status.compute_neighbors(self.config.max_neighbors, self.config.min_far_neighbor_follows)
        } else {
            (Vec::new(), Vec::new())
        };

        let result = CrawlResult {
            group_id: status.group_id,
            success,
            started_at: status.started_at,
            finished_at: now,
            member_ids: status.member_ids.clone(),
            member_fingerprint: member_fingerprint(&status.member_ids),
            error_count: status.error_ids.len() as u32,
            close_count: close.len() as u32,
            far_count: far.len() as u32,
            invalidated,
        };

        if success {
            self.records
                .put_neighbors(Neighbors { group_id: status.group_id, computed_at: now, close, far })
                .await?;
        }
        self.records.put_result(result.clone()).await?;
        Ok(result)
    }

    fn release(&self, crawl_id: Uuid) {
        let mut slot = self.active.lock();
        if slot.as_ref().is_some_and(|active| active.status.crawl_id == crawl_id) {
            *slot = None;
        }
    }
}

struct SeedingGuard<'a> {
    active: &'a Mutex<Option<ActiveCrawl>>,
    crawl_id: Uuid,
}

impl Drop for SeedingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.active.lock();
        let abandoned = slot
            .as_ref()
            .is_some_and(|a| a.status.crawl_id == self.crawl_id && a.status.phase == CrawlPhase::Seeding);
        if abandoned {
            warn!(crawl_id = %self.crawl_id, "Seeding abandoned; releasing crawl slot");
            *slot = None;
        }
    }
}
