//! Collaborator interfaces consumed by the crawler and ranking engine.
//!
//! Protocol clients, the post-content store and the group registry live
//! outside this crate; hosts implement these traits and hand them to the
//! [`Supervisor`](crate::Supervisor). [`memory`] has in-memory versions.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{Account, FollowPage, Group, NetworkFamily, PageCursor, Post, PostId};

/// Error type for collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Transport or protocol failure worth retrying.
    #[error("Request failed: {0}")]
    Request(String),
    /// The remote answered with something unusable.
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// The call exceeded its timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// No client is registered for the account's network family.
    #[error("No client registered for {0}")]
    Unsupported(NetworkFamily),
}

/// Run a collaborator call under `timeout`.
pub(crate) async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClientError::Timeout(timeout))?
}

/// Account lookup for one network family.
///
/// "Not found" and "host unreachable" are `Ok(None)`; anything else is an
/// error.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Fetch an account by its protocol identifier.
    async fn fetch_account(&self, identifier: &str) -> Result<Option<Account>, ClientError>;

    /// Resolve a handle to a protocol identifier.
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, ClientError>;
}

/// Follow-list pagination for one network family.
#[async_trait]
pub trait FollowClient: Send + Sync {
    /// Cursor of the first follow page of `account`, if it has one.
    async fn first_page_cursor(&self, account: &Account) -> Result<Option<PageCursor>, ClientError>;

    /// Fetch one page. `Ok(None)` means the page cannot be fetched.
    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Option<FollowPage>, ClientError>;
}

/// Both halves of a protocol client.
pub trait NetworkClient: AccountClient + FollowClient {}

impl<T: AccountClient + FollowClient> NetworkClient for T {}

/// Batch post lookup used to hydrate ranked posts.
#[async_trait]
pub trait PostContentStore: Send + Sync {
    /// Posts for the ids that exist; missing ids are left out.
    async fn get_many(&self, ids: &[PostId]) -> Result<HashMap<PostId, Post>, ClientError>;
}

/// Source of groups and their current membership.
#[async_trait]
pub trait GroupRegistry: Send + Sync {
    /// Every group.
    async fn get_all(&self) -> Result<Vec<Group>, ClientError>;
}

/// Network clients routed by [`NetworkFamily`].
#[derive(Clone, Default)]
pub struct NetworkClients {
    clients: HashMap<NetworkFamily, Arc<dyn NetworkClient>>,
}

impl NetworkClients {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client for `family`, replacing any previous one.
    pub fn with(mut self, family: NetworkFamily, client: Arc<dyn NetworkClient>) -> Self {
        self.clients.insert(family, client);
        self
    }

    /// Client for `family`.
    pub fn get(&self, family: NetworkFamily) -> Result<&Arc<dyn NetworkClient>, ClientError> {
        self.clients.get(&family).ok_or(ClientError::Unsupported(family))
    }

    /// Registered families.
    pub fn families(&self) -> Vec<NetworkFamily> {
        let mut families: Vec<_> = self.clients.keys().copied().collect();
        families.sort();
        families
    }
}
