//! Storage key layout.
//!
//! Every durable record lives under `<table prefix><domain key>`. Prefixes end
//! with `:` and group-scoped keys end their group segment with `:` too, so
//! prefix deletion for group 4 never touches group 42.

use crate::index::HourBucket;
use crate::types::{AccountId, GroupId};

/// Cached account lookups (ephemeral).
pub const ACCOUNT_PREFIX: &str = "account:";
/// Cached follow lists (ephemeral).
pub const FOLLOW_LIST_PREFIX: &str = "follows:";
/// Last crawl result per group (long-lived).
pub const CRAWL_RESULT_PREFIX: &str = "crawl_result:";
/// Neighbor sets per group (long-lived).
pub const NEIGHBORS_PREFIX: &str = "neighbors:";
/// Post appearance buckets (ephemeral).
pub const POST_INDEX_PREFIX: &str = "post_index:";
/// Reference count buckets (ephemeral).
pub const REFERENCE_INDEX_PREFIX: &str = "reference_index:";

/// Prefixes of all time-bucketed ephemeral indices.
pub const EPHEMERAL_INDEX_PREFIXES: [&str; 2] = [POST_INDEX_PREFIX, REFERENCE_INDEX_PREFIX];

/// Domain key for an account-scoped record.
pub fn account_key(account: &AccountId) -> String {
    account.storage_key()
}

/// Domain key for a group-scoped record.
pub fn group_key(group: GroupId) -> String {
    group.0.to_string()
}

/// Domain key for a (group, hour) bucket.
pub fn bucket_key(group: GroupId, hour: HourBucket) -> String {
    format!("{}:{}", group.0, hour)
}

/// Full-key prefix covering every bucket of `group` in `table`.
pub fn group_scope(table: &str, group: GroupId) -> String {
    format!("{}{}:", table, group.0)
}

/// Join a table prefix and domain key.
pub fn full_key(table: &str, domain_key: &str) -> String {
    format!("{}{}", table, domain_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_bucket_key_layout() {
        let hour = HourBucket::containing(Utc.with_ymd_and_hms(2024, 3, 1, 13, 45, 0).unwrap());
        let key = full_key(POST_INDEX_PREFIX, &bucket_key(GroupId(42), hour));
        assert_eq!(key, "post_index:42:2024-03-01T13");
        assert!(key.starts_with(&group_scope(POST_INDEX_PREFIX, GroupId(42))));
        assert!(!key.starts_with(&group_scope(POST_INDEX_PREFIX, GroupId(4))));
    }

    #[test]
    fn test_account_key_is_family_tagged() {
        let key = full_key(FOLLOW_LIST_PREFIX, &account_key(&AccountId::atproto("did:plc:x")));
        assert_eq!(key, "follows:atproto:did:plc:x");
    }
}
