//! In-memory state of the single active crawl.
//!
//! Everything here is synchronous: the worker mutates a [`CrawlStatus`] only
//! between suspension points, under its slot lock.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::collections::BoundedPriorityQueue;
use crate::types::{AccountId, FollowCounts, FollowList, GroupId, PageCursor, ScoredNeighbor};

/// Where a crawl is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    /// Slot claimed; member follow lists being looked up.
    Seeding,
    /// Work queue being drained and expanded.
    Fetching,
    /// Terminal state reached; results being written.
    Finalizing {
        /// Whether the crawl succeeded.
        success: bool,
    },
}

/// One unit of crawl work: fetch the next follow page of `account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowsFetchRequest {
    /// Account whose follows are fetched.
    pub account: AccountId,
    /// Page to fetch; `None` for the first page.
    pub cursor: Option<PageCursor>,
    /// Consecutive failures of this request.
    pub errors: u32,
}

impl FollowsFetchRequest {
    /// First-page request.
    pub fn first(account: AccountId) -> Self {
        Self { account, cursor: None, errors: 0 }
    }

    /// Request for the page after this one.
    pub fn next_page(&self, cursor: PageCursor) -> Self {
        Self { account: self.account.clone(), cursor: Some(cursor), errors: 0 }
    }

    /// The same request after one more failure.
    pub fn retried(&self) -> Self {
        Self { errors: self.errors + 1, ..self.clone() }
    }
}

/// Ranking key for neighbor candidates: member follows, then neighbor
/// follows, then smaller account id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CandidateRank {
    by_member: u32,
    by_neighbor: u32,
    account: Reverse<AccountId>,
}

impl CandidateRank {
    /// Rank of `account` with `counts`.
    pub fn new(account: &AccountId, counts: &FollowCounts) -> Self {
        Self {
            by_member: counts.by_member,
            by_neighbor: counts.by_neighbor,
            account: Reverse(account.clone()),
        }
    }
}

/// Observable state of the active crawl.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStatus {
    /// Correlates logs and guards against folding into a newer crawl.
    pub crawl_id: Uuid,
    /// Group being crawled.
    pub group_id: GroupId,
    /// Crawl start.
    pub started_at: DateTime<Utc>,
    /// Lifecycle phase.
    pub phase: CrawlPhase,
    /// Member snapshot taken at start. Never changes.
    pub member_ids: BTreeSet<AccountId>,
    /// Promoted neighbors.
    pub close_ids: BTreeSet<AccountId>,
    /// Accounts that could not be fetched.
    pub error_ids: BTreeSet<AccountId>,
    /// Follow counts of every account seen in a fetched follow list.
    pub follow_counts: HashMap<AccountId, FollowCounts>,
    /// Follow lists folded so far.
    pub lists_folded: u32,
}

impl CrawlStatus {
    /// Fresh status for a crawl of `group_id` over `members`.
    pub fn new(crawl_id: Uuid, group_id: GroupId, members: BTreeSet<AccountId>, started_at: DateTime<Utc>) -> Self {
        Self {
            crawl_id,
            group_id,
            started_at,
            phase: CrawlPhase::Seeding,
            member_ids: members,
            close_ids: BTreeSet::new(),
            error_ids: BTreeSet::new(),
            follow_counts: HashMap::new(),
            lists_folded: 0,
        }
    }

    /// Whether `account` is in the member snapshot.
    pub fn is_member(&self, account: &AccountId) -> bool {
        self.member_ids.contains(account)
    }

    fn is_candidate(&self, account: &AccountId) -> bool {
        !self.member_ids.contains(account)
            && !self.close_ids.contains(account)
            && !self.error_ids.contains(account)
    }

    /// Add the follows in `list` to the counts, weighted by whether the
    /// list's owner is a member. Self-follows are ignored.
    pub fn fold(&mut self, list: &FollowList) {
        let by_member = self.is_member(&list.account);
        for followed in list.follows.iter().filter(|f| **f != list.account) {
            let counts = self.follow_counts.entry(followed.clone()).or_default();
            if by_member {
                counts.by_member = counts.by_member.saturating_add(1);
            } else {
                counts.by_neighbor = counts.by_neighbor.saturating_add(1);
            }
        }
        self.lists_folded = self.lists_folded.saturating_add(1);
    }

    /// Record that `account` could not be fetched.
    ///
    /// An errored close neighbor leaves the close set; an errored member
    /// stays in the snapshot.
    pub fn mark_errored(&mut self, account: &AccountId) {
        self.close_ids.remove(account);
        self.error_ids.insert(account.clone());
    }

    /// Number of errored members.
    fn errored_members(&self) -> usize {
        self.error_ids.iter().filter(|a| self.member_ids.contains(*a)).count()
    }

    /// Members plus close neighbors, less errored members.
    ///
    /// Errored close neighbors already left the close set.
    pub fn actor_count(&self) -> usize {
        self.member_ids.len() + self.close_ids.len() - self.errored_members()
    }

    /// Whether errors exceed `ratio` of the current members plus close
    /// neighbors.
    pub fn error_limit_exceeded(&self, ratio: f64) -> bool {
        let denominator = (self.member_ids.len() + self.close_ids.len()) as f64;
        self.error_ids.len() as f64 > ratio * denominator
    }

    /// Best account not yet a member, close neighbor or errored.
    pub fn best_candidate(&self) -> Option<AccountId> {
        self.follow_counts
            .iter()
            .filter(|(account, _)| self.is_candidate(account))
            .max_by_key(|(account, counts)| CandidateRank::new(account, counts))
            .map(|(account, _)| account.clone())
    }

    /// Promote `account` to close neighbor. Returns `false` if it is not a
    /// candidate.
    pub fn promote(&mut self, account: &AccountId) -> bool {
        if !self.is_candidate(account) {
            return false;
        }
        self.close_ids.insert(account.clone())
    }

    fn counts_of(&self, account: &AccountId) -> FollowCounts {
        self.follow_counts.get(account).copied().unwrap_or_default()
    }

    /// Final close and far neighbor lists.
    ///
    /// Close neighbors are ranked and capped at `max_neighbors`; far
    /// neighbors are the best remaining candidates with a combined count
    /// above `min_far_follows`, filling the cap.
    pub fn compute_neighbors(&self, max_neighbors: usize, min_far_follows: u32) -> (Vec<ScoredNeighbor>, Vec<ScoredNeighbor>) {
        let mut close: Vec<ScoredNeighbor> = self
            .close_ids
            .iter()
            .map(|account| ScoredNeighbor::new(account.clone(), self.counts_of(account)))
            .collect();
        close.sort_by(|a, b| CandidateRank::new(&b.account, &b.counts).cmp(&CandidateRank::new(&a.account, &a.counts)));
        close.truncate(max_neighbors);

        let far_slots = max_neighbors - close.len();
        let mut top = BoundedPriorityQueue::new(far_slots);
        for (account, counts) in &self.follow_counts {
            if self.is_candidate(account) && counts.total() > min_far_follows {
                top.offer_top(account.clone(), CandidateRank::new(account, counts));
            }
        }
        let far = top
            .into_sorted_desc()
            .into_iter()
            .map(|(account, _)| {
                let counts = self.counts_of(&account);
                ScoredNeighbor::new(account, counts)
            })
            .collect();

        (close, far)
    }
}
