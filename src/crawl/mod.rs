//! Neighbor discovery by follow-graph crawling.
//!
//! ## Overview
//!
//! ```text
//! scheduler tick ──► crawl_decision ──► claim slot, seed members
//!                                              │
//! crawl tick ──► batch of FollowsFetchRequest ─┤ (join_all)
//!                 │                            ▼
//!                 │           fold pages into CrawlStatus (in order)
//!                 ▼
//!   queue drained ──► promote best candidate ──► ... ──► finalize
//! ```
//!
//! At most one crawl runs at a time. The active crawl lives in a single
//! mutex-guarded slot that is checked and claimed in one critical section.

pub mod config;
pub mod policy;
pub mod repository;
pub mod status;
pub mod worker;

use uuid::Uuid;

use crate::clients::ClientError;
use crate::store::StoreError;
use crate::types::AccountId;

pub use config::CrawlConfig;
pub use policy::{crawl_decision, CrawlDecision, StartReason};
pub use repository::{AccountRepository, CrawlRecords, FollowListRepository, PageFetch};
pub use status::{CandidateRank, CrawlPhase, CrawlStatus, FollowsFetchRequest};
pub use worker::{CrawlTick, CrawlWorker, SchedulerTick};

/// Error type for crawl operations.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Storage failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Collaborator failure.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    /// A follow page could not be fetched.
    #[error("Follow page unavailable for {0}")]
    PageUnavailable(AccountId),
    /// The follow list has more pages than allowed.
    #[error("Follow list of {account} exceeds {pages} pages")]
    TooManyPages {
        /// Account being fetched.
        account: AccountId,
        /// Page limit.
        pages: usize,
    },
    /// The crawl was replaced while a step was in flight.
    #[error("Crawl {0} is no longer active")]
    Superseded(Uuid),
}
