//! # neighborhood-kernel
//!
//! Neighbor discovery, cached persistence and reference ranking for groups
//! of accounts on federated social networks (ActivityPub and AT Protocol).
//!
//! The kernel answers two questions for a group:
//!
//! > Which accounts beyond the members form the group's neighborhood?
//!
//! > Which recent posts does the group reference the most?
//!
//! ## Architecture
//!
//! ```text
//! GroupRegistry ─┐
//!                ▼
//! NetworkClients → AccountRepository → FollowListRepository → CrawlWorker → CrawlRecords
//!                      (CachedStore)        (CachedStore)
//!
//! ingestion → PostIndexBuffer / ReferenceBuffer → RankingEngine → PostContentStore
//!                  (BufferedIndex)
//! ```
//!
//! A single [`Supervisor`] owns every component and runs the periodic tasks.
//!
//! ## Guarantees
//!
//! - At most one crawl runs at a time
//! - Close and far neighbors together never exceed `max_neighbors`
//! - Ephemeral storage never grows past its row ceiling
//! - Same buckets + same scorer → identical ranking order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod collections;
pub mod clock;
pub mod config;
pub mod store;
pub mod index;
pub mod clients;
pub mod crawl;
pub mod ranking;
pub mod supervisor;
pub mod telemetry;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    Account, AccountId, AccountIdError, CrawlResult, FollowCounts, FollowList, FollowPage, Group, GroupId,
    MembershipChange, Neighbors, NetworkFamily, PageCursor, Post, PostId, PostIndex, ReferenceCounts,
    ReferenceIndex, ReferenceKind, ScoredNeighbor, ScoredPost,
};
pub use collections::{BoundedPriorityQueue, BoundedQueue};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, KernelConfig};
pub use store::{
    CacheConfig, CacheStats, CachedStore, DurableStore, EphemeralRecord, EphemeralStore, InMemoryDurableStore,
    InMemoryEphemeralStore, Lookup, MemoryCache, MirroredStore, StoreError,
};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresDurableStore, PostgresEphemeralStore};
pub use index::{FlushReport, HourBucket, IndexConfig, PostIndexBuffer, ReferenceBuffer};
pub use clients::{
    AccountClient, ClientError, FollowClient, GroupRegistry, NetworkClient, NetworkClients, PostContentStore,
};
pub use clients::memory::{InMemoryNetwork, InMemoryPostStore, StaticGroupRegistry};
pub use crawl::{CrawlConfig, CrawlError, CrawlStatus, CrawlTick, CrawlWorker, SchedulerTick};
pub use ranking::{KindWeights, RankingConfig, RankingEngine, RankingError, ReferenceScorer, WeightedScorer};
pub use supervisor::{Collaborators, Supervisor, SupervisorError};
pub use telemetry::{init_tracing, LogFormat};

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};
