//! In-memory collaborators for tests and simulations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Account, AccountId, FollowPage, Group, PageCursor, Post, PostId};
use super::{AccountClient, ClientError, FollowClient, GroupRegistry, PostContentStore};

#[derive(Debug, Default)]
struct Graph {
    /// Every account that exists, by protocol identifier.
    accounts: HashMap<String, AccountId>,
    handles: HashMap<String, String>,
    follows: HashMap<AccountId, Vec<AccountId>>,
    /// Remaining injected page failures per account.
    transient_failures: HashMap<AccountId, u32>,
    /// Accounts whose pages can never be fetched.
    broken: HashSet<AccountId>,
}

/// Simulated follow graph serving both client traits.
///
/// Any account that appears in the graph exists. Cursors have the form
/// `<account id>|<offset>`.
#[derive(Debug)]
pub struct InMemoryNetwork {
    graph: RwLock<Graph>,
    page_size: usize,
    page_fetches: AtomicU64,
}

impl InMemoryNetwork {
    /// Empty graph serving `page_size` follows per page.
    pub fn new(page_size: usize) -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            page_size: page_size.max(1),
            page_fetches: AtomicU64::new(0),
        }
    }

    /// Register an account with no follows.
    pub fn add_account(&self, id: &AccountId) {
        self.graph.write().accounts.insert(id.value().to_string(), id.clone());
    }

    /// Register a handle for `id`.
    pub fn add_handle(&self, handle: &str, id: &AccountId) {
        let mut graph = self.graph.write();
        graph.accounts.insert(id.value().to_string(), id.clone());
        graph.handles.insert(handle.to_string(), id.value().to_string());
    }

    /// Set who `id` follows. Every account involved comes into existence.
    pub fn set_follows(&self, id: &AccountId, follows: impl IntoIterator<Item = AccountId>) {
        let follows: Vec<AccountId> = follows.into_iter().collect();
        let mut graph = self.graph.write();
        graph.accounts.insert(id.value().to_string(), id.clone());
        for followed in &follows {
            graph.accounts.insert(followed.value().to_string(), followed.clone());
        }
        graph.follows.insert(id.clone(), follows);
    }

    /// Make `id` unknown to account lookups.
    pub fn remove_account(&self, id: &AccountId) {
        self.graph.write().accounts.remove(id.value());
    }

    /// Fail the next `count` page fetches of `id` with a request error.
    pub fn fail_pages(&self, id: &AccountId, count: u32) {
        self.graph.write().transient_failures.insert(id.clone(), count);
    }

    /// Make every page fetch of `id` come back empty-handed.
    pub fn break_account(&self, id: &AccountId) {
        self.graph.write().broken.insert(id.clone());
    }

    /// Number of `fetch_page` calls served so far.
    pub fn page_fetches(&self) -> u64 {
        self.page_fetches.load(Ordering::Relaxed)
    }

    fn parse_cursor(cursor: &PageCursor) -> Result<(AccountId, usize), ClientError> {
        let (account, offset) = cursor
            .as_str()
            .rsplit_once('|')
            .ok_or_else(|| ClientError::Malformed(format!("cursor {}", cursor.as_str())))?;
        let account = account
            .parse::<AccountId>()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        let offset = offset
            .parse::<usize>()
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok((account, offset))
    }
}

#[async_trait]
impl AccountClient for InMemoryNetwork {
    async fn fetch_account(&self, identifier: &str) -> Result<Option<Account>, ClientError> {
        let graph = self.graph.read();
        Ok(graph.accounts.get(identifier).map(|id| {
            let mut account = Account::new(id.clone(), id.value());
            account.follows_count = graph.follows.get(id).map(|f| f.len() as u64);
            account
        }))
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, ClientError> {
        Ok(self.graph.read().handles.get(handle).cloned())
    }
}

#[async_trait]
impl FollowClient for InMemoryNetwork {
    async fn first_page_cursor(&self, account: &Account) -> Result<Option<PageCursor>, ClientError> {
        Ok(Some(PageCursor::new(format!("{}|0", account.id))))
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Option<FollowPage>, ClientError> {
        self.page_fetches.fetch_add(1, Ordering::Relaxed);
        let (account, offset) = Self::parse_cursor(cursor)?;

        let mut graph = self.graph.write();
        if graph.broken.contains(&account) {
            return Ok(None);
        }
        if let Some(remaining) = graph.transient_failures.get_mut(&account) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Request(format!("injected failure for {}", account)));
            }
        }

        let follows = graph.follows.get(&account).map(Vec::as_slice).unwrap_or(&[]);
        let end = (offset + self.page_size).min(follows.len());
        let followed = follows.get(offset..end).map(<[AccountId]>::to_vec).unwrap_or_default();
        let next = (end < follows.len()).then(|| PageCursor::new(format!("{}|{}", account, end)));
        Ok(Some(FollowPage { followed, next }))
    }
}

/// In-memory post-content store that records how it was queried.
#[derive(Debug, Default)]
pub struct InMemoryPostStore {
    posts: RwLock<BTreeMap<PostId, Post>>,
    batches: RwLock<Vec<Vec<PostId>>>,
}

impl InMemoryPostStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a post.
    pub fn insert(&self, post: Post) {
        self.posts.write().insert(post.id.clone(), post);
    }

    /// Every `get_many` call's id list, in call order.
    pub fn batches(&self) -> Vec<Vec<PostId>> {
        self.batches.read().clone()
    }
}

#[async_trait]
impl PostContentStore for InMemoryPostStore {
    async fn get_many(&self, ids: &[PostId]) -> Result<HashMap<PostId, Post>, ClientError> {
        self.batches.write().push(ids.to_vec());
        let posts = self.posts.read();
        Ok(ids
            .iter()
            .filter_map(|id| posts.get(id).map(|post| (id.clone(), post.clone())))
            .collect())
    }
}

/// Fixed, replaceable list of groups.
#[derive(Debug, Default)]
pub struct StaticGroupRegistry {
    groups: RwLock<Vec<Group>>,
}

impl StaticGroupRegistry {
    /// Registry serving `groups`.
    pub fn new(groups: Vec<Group>) -> Self {
        Self { groups: RwLock::new(groups) }
    }

    /// Insert or replace a group by id.
    pub fn upsert(&self, group: Group) {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = group,
            None => groups.push(group),
        }
    }
}

#[async_trait]
impl GroupRegistry for StaticGroupRegistry {
    async fn get_all(&self) -> Result<Vec<Group>, ClientError> {
        Ok(self.groups.read().clone())
    }
}
