//! Scheduler decision: does a group need a crawl now?

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::types::{CrawlResult, Group};
use super::config::CrawlConfig;

/// Why a crawl is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    /// No result on record.
    NeverCrawled,
    /// Membership differs from the last result's snapshot.
    MembershipChanged,
    /// A membership change was reported since the last result.
    Invalidated,
    /// The last successful result is past the success cooldown.
    Stale,
    /// The last crawl failed and the failure cooldown passed.
    RetryAfterFailure,
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NeverCrawled => "never_crawled",
            Self::MembershipChanged => "membership_changed",
            Self::Invalidated => "invalidated",
            Self::Stale => "stale",
            Self::RetryAfterFailure => "retry_after_failure",
        };
        f.write_str(s)
    }
}

/// Scheduler verdict for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlDecision {
    /// Start a crawl.
    Start(StartReason),
    /// Nothing to do.
    Skip,
}

/// Decide whether `group` needs a crawl at `now`.
///
/// Groups without members are never crawled.
pub fn crawl_decision(
    previous: Option<&CrawlResult>,
    group: &Group,
    now: DateTime<Utc>,
    config: &CrawlConfig,
) -> CrawlDecision {
    if group.members.is_empty() {
        return CrawlDecision::Skip;
    }
    let Some(previous) = previous else {
        return CrawlDecision::Start(StartReason::NeverCrawled);
    };
    if !previous.matches_members(&group.members) {
        return CrawlDecision::Start(StartReason::MembershipChanged);
    }
    if previous.invalidated {
        return CrawlDecision::Start(StartReason::Invalidated);
    }

    let age = now - previous.finished_at;
    match previous.success {
        true if age >= config.success_cooldown() => CrawlDecision::Start(StartReason::Stale),
        false if age >= config.failure_cooldown() => CrawlDecision::Start(StartReason::RetryAfterFailure),
        _ => CrawlDecision::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{member_fingerprint, AccountId, GroupId};
    use chrono::{Duration, TimeZone};

    fn group() -> Group {
        Group::new(GroupId(1), "friends", [AccountId::atproto("did:plc:a")])
    }

    fn result(group: &Group, success: bool, finished_at: DateTime<Utc>) -> CrawlResult {
        CrawlResult {
            group_id: group.id,
            success,
            started_at: finished_at - Duration::minutes(5),
            finished_at,
            member_ids: group.members.clone(),
            member_fingerprint: member_fingerprint(&group.members),
            error_count: 0,
            close_count: 0,
            far_count: 0,
            invalidated: false,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_never_crawled_starts() {
        let config = CrawlConfig::default();
        assert_eq!(crawl_decision(None, &group(), t0(), &config), CrawlDecision::Start(StartReason::NeverCrawled));
    }

    #[test]
    fn test_empty_group_skipped() {
        let config = CrawlConfig::default();
        let empty = Group::new(GroupId(2), "empty", Vec::<AccountId>::new());
        assert_eq!(crawl_decision(None, &empty, t0(), &config), CrawlDecision::Skip);
    }

    #[test]
    fn test_cooldowns() {
        let config = CrawlConfig::default();
        let g = group();

        let ok = result(&g, true, t0());
        assert_eq!(crawl_decision(Some(&ok), &g, t0() + Duration::hours(2), &config), CrawlDecision::Skip);
        assert_eq!(
            crawl_decision(Some(&ok), &g, t0() + config.success_cooldown(), &config),
            CrawlDecision::Start(StartReason::Stale)
        );

        let failed = result(&g, false, t0());
        assert_eq!(
            crawl_decision(Some(&failed), &g, t0() + Duration::hours(2), &config),
            CrawlDecision::Start(StartReason::RetryAfterFailure)
        );
    }

    #[test]
    fn test_membership_change_and_invalidation() {
        let config = CrawlConfig::default();
        let g = group();
        let mut previous = result(&g, true, t0());

        let mut grown = g.clone();
        grown.members.insert(AccountId::atproto("did:plc:b"));
        assert_eq!(
            crawl_decision(Some(&previous), &grown, t0(), &config),
            CrawlDecision::Start(StartReason::MembershipChanged)
        );

        previous.invalidated = true;
        assert_eq!(
            crawl_decision(Some(&previous), &g, t0(), &config),
            CrawlDecision::Start(StartReason::Invalidated)
        );
    }
}
