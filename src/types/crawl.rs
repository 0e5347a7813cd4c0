//! Durable crawl outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use xxhash_rust::xxh64::Xxh64;

use super::account::{AccountId, GroupId};
use super::follow::FollowCounts;

/// Fingerprint of a member set: xxHash64 over the sorted stable ids,
/// newline-terminated, as 16 hex digits.
pub fn member_fingerprint(members: &BTreeSet<AccountId>) -> String {
    let mut hasher = Xxh64::new(0);
    for member in members {
        hasher.update(member.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:016x}", hasher.digest())
}

/// Outcome of the most recent crawl of a group. One per group, overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    /// Group crawled.
    pub group_id: GroupId,
    /// Whether the crawl finalized successfully.
    pub success: bool,
    /// Crawl start.
    pub started_at: DateTime<Utc>,
    /// Crawl end.
    pub finished_at: DateTime<Utc>,
    /// Member snapshot the crawl ran against.
    pub member_ids: BTreeSet<AccountId>,
    /// Fingerprint of `member_ids`.
    pub member_fingerprint: String,
    /// Accounts that could not be fetched.
    pub error_count: u32,
    /// Close neighbors found (0 on failure).
    pub close_count: u32,
    /// Far neighbors found (0 on failure).
    pub far_count: u32,
    /// Set when a membership change was reported after this result.
    #[serde(default)]
    pub invalidated: bool,
}

impl CrawlResult {
    /// Whether the result was computed against exactly `members`.
    pub fn matches_members(&self, members: &BTreeSet<AccountId>) -> bool {
        self.member_ids == *members
    }
}

/// A neighbor with its follow counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredNeighbor {
    /// Neighbor account.
    pub account: AccountId,
    /// Follow counts split by origin.
    pub counts: FollowCounts,
    /// Combined follow count.
    pub score: u32,
}

impl ScoredNeighbor {
    /// Build from counts; score is the combined count.
    pub fn new(account: AccountId, counts: FollowCounts) -> Self {
        Self { score: counts.total(), account, counts }
    }
}

/// Neighbor sets produced by the last successful crawl of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    /// Group.
    pub group_id: GroupId,
    /// When the sets were computed.
    pub computed_at: DateTime<Utc>,
    /// Promoted neighbors, best first.
    pub close: Vec<ScoredNeighbor>,
    /// Observed but never promoted, best first.
    pub far: Vec<ScoredNeighbor>,
}

impl Neighbors {
    /// Close plus far count.
    pub fn len(&self) -> usize {
        self.close.len() + self.far.len()
    }

    /// Whether both sets are empty.
    pub fn is_empty(&self) -> bool {
        self.close.is_empty() && self.far.is_empty()
    }

    /// Whether `account` is a close or far neighbor.
    pub fn contains(&self, account: &AccountId) -> bool {
        self.close.iter().chain(self.far.iter()).any(|n| &n.account == account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_fingerprint_order_independent() {
        let a: BTreeSet<_> = [AccountId::atproto("did:plc:b"), AccountId::atproto("did:plc:a")].into();
        let b: BTreeSet<_> = [AccountId::atproto("did:plc:a"), AccountId::atproto("did:plc:b")].into();
        assert_eq!(member_fingerprint(&a), member_fingerprint(&b));
        assert_eq!(member_fingerprint(&a).len(), 16);

        let c: BTreeSet<_> = [AccountId::atproto("did:plc:a")].into();
        assert_ne!(member_fingerprint(&a), member_fingerprint(&c));
        assert_ne!(member_fingerprint(&c), member_fingerprint(&BTreeSet::new()));
    }

    #[test]
    fn test_invalidated_defaults_false() {
        let json = r#"{
            "group_id": 1, "success": true,
            "started_at": "2024-01-01T00:00:00Z", "finished_at": "2024-01-01T00:10:00Z",
            "member_ids": [], "member_fingerprint": "x",
            "error_count": 0, "close_count": 0, "far_count": 0
        }"#;
        let result: CrawlResult = serde_json::from_str(json).unwrap();
        assert!(!result.invalidated);
    }
}
