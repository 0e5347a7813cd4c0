//! Repositories the crawler reads and writes through.
//!
//! Accounts and follow lists are ephemeral and cached ([`CachedStore`]);
//! crawl results and neighbor sets are long-lived and mirrored
//! ([`MirroredStore`]).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clients::{call_with_timeout, NetworkClients};
use crate::clock::Clock;
use crate::store::keys::{account_key, group_key, ACCOUNT_PREFIX, CRAWL_RESULT_PREFIX, FOLLOW_LIST_PREFIX, NEIGHBORS_PREFIX};
use crate::store::{read_with_timeout, write_with_timeout, CacheConfig, CachedStore, DurableStore, EphemeralStore, Lookup, MirroredStore, StoreError};
use crate::types::{Account, AccountId, CrawlResult, FollowList, FollowPage, GroupId, NetworkFamily, Neighbors};
use super::config::CrawlConfig;
use super::status::FollowsFetchRequest;
use super::CrawlError;

/// Cached account lookups with negative caching.
pub struct AccountRepository {
    cache: CachedStore<Account>,
    clients: NetworkClients,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl AccountRepository {
    /// Create a repository over `store`.
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        cache_config: &CacheConfig,
        clients: NetworkClients,
        config: &CrawlConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: CachedStore::new(ACCOUNT_PREFIX, store, cache_config, config.account_ttl(), clock),
            clients,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    /// Look up `id`, from cache when known, otherwise from its network.
    ///
    /// Not-found results are cached too.
    pub async fn get(&self, id: &AccountId) -> Result<Option<Account>, CrawlError> {
        let key = account_key(id);
        match self.cache.get(&key).await {
            Ok(Lookup::Found(account)) => return Ok(Some(account)),
            Ok(Lookup::Absent) => return Ok(None),
            Ok(Lookup::Unknown) => {}
            Err(e) => warn!(account = %id, error = %e, "Account cache read failed; asking the network"),
        }

        let client = self.clients.get(id.family())?;
        let account = call_with_timeout(self.read_timeout, client.fetch_account(id.value())).await?;
        debug!(account = %id, found = account.is_some(), "Fetched account");

        if let Err(e) = write_with_timeout(self.write_timeout, self.cache.store(&key, account.clone())).await {
            warn!(account = %id, error = %e, "Failed to cache account lookup");
        }
        Ok(account)
    }

    /// Resolve a user-entered handle to an account id.
    ///
    /// The network is inferred from the handle's shape; unrecognized shapes
    /// resolve to `None`.
    pub async fn resolve_handle(&self, handle: &str) -> Result<Option<AccountId>, CrawlError> {
        let handle = handle.trim();
        let Some(family) = NetworkFamily::infer_from_handle(handle) else {
            debug!(handle = handle, "Unrecognized handle shape");
            return Ok(None);
        };
        let lookup = match family {
            NetworkFamily::ActivityPub => handle,
            NetworkFamily::AtProto => handle.trim_start_matches('@'),
        };
        if family == NetworkFamily::AtProto && lookup.starts_with("did:") {
            return Ok(Some(AccountId::atproto(lookup)));
        }

        let client = self.clients.get(family)?;
        let identifier = call_with_timeout(self.read_timeout, client.resolve_handle(lookup)).await?;
        Ok(identifier.map(|value| AccountId::new(family, value)))
    }

    /// Underlying cache.
    pub fn cache(&self) -> &CachedStore<Account> {
        &self.cache
    }
}

/// Result of fetching one follow page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFetch {
    /// The account does not exist or exposes no follow list.
    NotFound,
    /// The page could not be fetched.
    Unavailable,
    /// The page.
    Page(FollowPage),
}

/// Cached follow lists plus page-level fetching.
pub struct FollowListRepository {
    cache: CachedStore<FollowList>,
    accounts: Arc<AccountRepository>,
    clients: NetworkClients,
    clock: Arc<dyn Clock>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_pages: usize,
}

impl FollowListRepository {
    /// Create a repository over `store`.
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        cache_config: &CacheConfig,
        accounts: Arc<AccountRepository>,
        clients: NetworkClients,
        config: &CrawlConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: CachedStore::new(FOLLOW_LIST_PREFIX, store, cache_config, config.follow_list_ttl(), clock.clone()),
            accounts,
            clients,
            clock,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            max_pages: config.max_pages_per_fetch,
        }
    }

    /// Cached follow list of `id`, with its remaining TTL filled in.
    pub async fn cached(&self, id: &AccountId) -> Result<Option<FollowList>, StoreError> {
        let Some(entry) = self.cache.get_entry(&account_key(id)).await? else {
            return Ok(None);
        };
        let remaining = entry.remaining_ttl(self.clock.now());
        Ok(entry.value.map(|mut list| {
            list.remaining_ttl = Some(remaining);
            list
        }))
    }

    /// Store a successfully fetched follow list.
    pub async fn commit(&self, list: &FollowList) -> Result<(), StoreError> {
        let key = account_key(&list.account);
        write_with_timeout(self.write_timeout, self.cache.store(&key, Some(list.clone()))).await
    }

    /// Fetch the page `request` points at.
    ///
    /// A first-page request resolves the account (through the account
    /// cache) and asks its network for the first cursor.
    pub async fn fetch_page(&self, request: &FollowsFetchRequest) -> Result<PageFetch, CrawlError> {
        let client = self.clients.get(request.account.family())?;

        let cursor = match &request.cursor {
            Some(cursor) => cursor.clone(),
            None => {
                let Some(account) = self.accounts.get(&request.account).await? else {
                    return Ok(PageFetch::NotFound);
                };
                match call_with_timeout(self.read_timeout, client.first_page_cursor(&account)).await? {
                    Some(cursor) => cursor,
                    None => return Ok(PageFetch::NotFound),
                }
            }
        };

        Ok(match call_with_timeout(self.read_timeout, client.fetch_page(&cursor)).await? {
            Some(page) => PageFetch::Page(page),
            None => PageFetch::Unavailable,
        })
    }

    /// Fetch and cache the complete follow list of `id`, outside any crawl.
    ///
    /// Returns the cached list when one is live. `None` means the account
    /// does not exist.
    pub async fn fetch_all(&self, id: &AccountId) -> Result<Option<FollowList>, CrawlError> {
        match self.cached(id).await {
            Ok(Some(list)) => return Ok(Some(list)),
            Ok(None) => {}
            Err(e) => warn!(account = %id, error = %e, "Follow list cache read failed; refetching"),
        }

        let mut request = FollowsFetchRequest::first(id.clone());
        let mut follows = Vec::new();
        for _ in 0..self.max_pages {
            match self.fetch_page(&request).await? {
                PageFetch::NotFound => return Ok(None),
                PageFetch::Unavailable => return Err(CrawlError::PageUnavailable(id.clone())),
                PageFetch::Page(page) => {
                    follows.extend(page.followed);
                    match page.next {
                        Some(cursor) => request = request.next_page(cursor),
                        None => {
                            let list = FollowList::new(id.clone(), follows, self.clock.now());
                            self.commit(&list).await?;
                            return Ok(Some(list));
                        }
                    }
                }
            }
        }
        Err(CrawlError::TooManyPages { account: id.clone(), pages: self.max_pages })
    }

    /// Underlying cache.
    pub fn cache(&self) -> &CachedStore<FollowList> {
        &self.cache
    }
}

/// Long-lived crawl results and neighbor sets, one of each per group.
pub struct CrawlRecords {
    results: MirroredStore<CrawlResult>,
    neighbors: MirroredStore<Neighbors>,
    write_timeout: Duration,
}

impl CrawlRecords {
    /// Load both tables from `store`, each scan bounded by `read_timeout`.
    pub async fn load(
        store: Arc<dyn DurableStore>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            results: read_with_timeout(read_timeout, MirroredStore::load(CRAWL_RESULT_PREFIX, store.clone())).await?,
            neighbors: read_with_timeout(read_timeout, MirroredStore::load(NEIGHBORS_PREFIX, store)).await?,
            write_timeout,
        })
    }

    /// Last crawl result of `group`.
    pub fn result(&self, group: GroupId) -> Option<CrawlResult> {
        self.results.get(&group_key(group))
    }

    /// Neighbors from the last successful crawl of `group`.
    pub fn neighbors(&self, group: GroupId) -> Option<Neighbors> {
        self.neighbors.get(&group_key(group))
    }

    /// Groups with a crawl result on record.
    pub fn crawled_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self
            .results
            .keys()
            .iter()
            .filter_map(|k| k.parse().ok().map(GroupId))
            .collect();
        groups.sort();
        groups
    }

    /// Overwrite the result of its group.
    pub async fn put_result(&self, result: CrawlResult) -> Result<(), StoreError> {
        let key = group_key(result.group_id);
        write_with_timeout(self.write_timeout, self.results.put(&key, result)).await
    }

    /// Overwrite the neighbors of their group.
    pub async fn put_neighbors(&self, neighbors: Neighbors) -> Result<(), StoreError> {
        let key = group_key(neighbors.group_id);
        write_with_timeout(self.write_timeout, self.neighbors.put(&key, neighbors)).await
    }

    /// Flag the last result of `group` so the scheduler re-crawls it.
    ///
    /// Returns `false` when the group has no result yet.
    pub async fn invalidate(&self, group: GroupId) -> Result<bool, StoreError> {
        let Some(mut result) = self.result(group) else {
            return Ok(false);
        };
        if result.invalidated {
            return Ok(true);
        }
        result.invalidated = true;
        self.put_result(result).await?;
        Ok(true)
    }
}
