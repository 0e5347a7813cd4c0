//! Core types shared by the crawler, persistence layer and ranking engine.

pub mod account;
pub mod follow;
pub mod post;
pub mod crawl;

pub use account::{Account, AccountId, AccountIdError, Group, GroupId, MembershipChange, NetworkFamily};
pub use follow::{FollowCounts, FollowList, FollowPage, PageCursor};
pub use post::{Post, PostId, PostIndex, ReferenceCounts, ReferenceIndex, ReferenceKind, ScoredPost};
pub use crawl::{member_fingerprint, CrawlResult, Neighbors, ScoredNeighbor};
