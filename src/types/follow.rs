//! Follow-graph records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::account::AccountId;

/// The accounts one account follows, as last fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowList {
    /// Account whose follows these are.
    pub account: AccountId,
    /// Followed accounts.
    pub follows: BTreeSet<AccountId>,
    /// When the list was fetched.
    pub updated_at: DateTime<Utc>,
    /// Time-to-live remaining when the list was read back from storage.
    ///
    /// Not persisted; filled in by the repository from the row's expiry.
    #[serde(skip)]
    pub remaining_ttl: Option<Duration>,
}

impl FollowList {
    /// Create a freshly fetched follow list.
    pub fn new(account: AccountId, follows: impl IntoIterator<Item = AccountId>, updated_at: DateTime<Utc>) -> Self {
        Self {
            account,
            follows: follows.into_iter().collect(),
            updated_at,
            remaining_ttl: None,
        }
    }

    /// Number of followed accounts.
    pub fn len(&self) -> usize {
        self.follows.len()
    }

    /// Whether the account follows nobody.
    pub fn is_empty(&self) -> bool {
        self.follows.is_empty()
    }
}

/// How often an account was followed by crawled accounts, split by origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowCounts {
    /// Follows contributed by group members.
    pub by_member: u32,
    /// Follows contributed by close neighbors.
    pub by_neighbor: u32,
}

impl FollowCounts {
    /// Combined follow count, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.by_member.saturating_add(self.by_neighbor)
    }

    /// Ranking key: member follows first, neighbor follows as tie-break.
    pub fn rank_key(&self) -> (u32, u32) {
        (self.by_member, self.by_neighbor)
    }
}

/// One page of a follow list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowPage {
    /// Accounts on this page.
    pub followed: Vec<AccountId>,
    /// Cursor for the next page, `None` on the terminal page.
    pub next: Option<PageCursor>,
}

/// Opaque pagination cursor; only the issuing client interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(pub String);

impl PageCursor {
    /// Wrap a client-specific cursor token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_saturates() {
        let counts = FollowCounts { by_member: u32::MAX, by_neighbor: 3 };
        assert_eq!(counts.total(), u32::MAX);
    }

    #[test]
    fn test_rank_key_prefers_member_follows() {
        let a = FollowCounts { by_member: 2, by_neighbor: 0 };
        let b = FollowCounts { by_member: 1, by_neighbor: 9 };
        assert!(a.rank_key() > b.rank_key());
        assert_eq!(b.total(), 10);
    }

    #[test]
    fn test_follow_list_ttl_not_serialized() {
        let mut list = FollowList::new(
            AccountId::atproto("did:plc:a"),
            [AccountId::atproto("did:plc:b")],
            Utc::now(),
        );
        list.remaining_ttl = Some(Duration::hours(1));

        let json = serde_json::to_string(&list).unwrap();
        let back: FollowList = serde_json::from_str(&json).unwrap();
        assert_eq!(back.remaining_ttl, None);
        assert_eq!(back.follows, list.follows);
    }
}
