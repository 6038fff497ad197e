//! Read path for UI collaborators.
//!
//! Reads are cache-first. A stale page is served immediately while a
//! background refetch replaces it; a missing page is fetched inline. Every
//! network fetch is tagged with a [`FetchTicket`](super::store::FetchTicket)
//! so that a response older than an applied patch never overwrites it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::domain::entities::{Collection, Entity, PageInfo};

use super::config::CacheConfig;
use super::keys::{CacheKey, DetailKey};
use super::lock::mutex_lock;
use super::metric_keys::REFETCH_FAILURE_TOTAL;
use super::retry::{RetryPolicy, retry};
use super::store::{CacheEntry, CacheStore, SetOutcome};

const SOURCE: &str = "cache::query";

/// One page as returned by the data service.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub items: Vec<Entity>,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to data service failed: {0}")]
    Transport(String),
    #[error("data service answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed data service response: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

/// A background refetch gave up; the cached page was kept and flagged outdated.
#[derive(Debug, Error)]
#[error("refetch of `{key}` failed after {attempts} attempt(s): {source}")]
pub struct RefetchError {
    pub key: String,
    pub attempts: u32,
    #[source]
    pub source: FetchError,
}

/// Where the data service's pages come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, key: &CacheKey) -> Result<PageSnapshot, FetchError>;

    async fn fetch_entity(&self, key: &DetailKey) -> Result<Entity, FetchError>;
}

/// Something that can bring a whole collection up to date.
#[async_trait]
pub trait Refresh: Send + Sync {
    async fn refresh(&self, collection: &Collection) -> RefreshSummary;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Fetched inline because nothing was cached.
    Network,
    Fresh,
    /// Served stale; a background refetch was scheduled.
    Stale,
}

#[derive(Debug, Clone)]
pub struct PageRead {
    pub entry: CacheEntry,
    pub source: ReadSource,
    /// The last background refetch for this page failed.
    pub outdated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    Updated,
    /// A newer patch was applied while the request was in flight.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshSummary {
    pub updated: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Cache-first query client over a [`PageSource`].
pub struct QueryClient {
    store: Arc<CacheStore>,
    source: Arc<dyn PageSource>,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<CacheKey>>,
}

impl QueryClient {
    pub fn new(store: Arc<CacheStore>, source: Arc<dyn PageSource>, config: &CacheConfig) -> Self {
        Self {
            store,
            source,
            retry: config.retry_policy(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Read one page, fetching it if absent and revalidating it if stale.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn page(self: &Arc<Self>, key: &CacheKey) -> Result<PageRead, FetchError> {
        if let Some(entry) = self.store.get(key) {
            let outdated = self.store.is_outdated(key);
            if !entry.is_stale() {
                return Ok(PageRead {
                    entry,
                    source: ReadSource::Fresh,
                    outdated,
                });
            }

            self.spawn_refetch(key.clone());
            return Ok(PageRead {
                entry,
                source: ReadSource::Stale,
                outdated,
            });
        }

        let mut attempt = 1;
        let entry = loop {
            let ticket = self.store.begin_fetch(key);
            let snapshot = self.source.fetch_page(key).await?;
            let entry = self.entry_for(key, snapshot);

            match self.store.set_fetched(&ticket, entry.clone()) {
                SetOutcome::Stored => break entry,
                SetOutcome::Discarded => {
                    if let Some(cached) = self.store.get(key) {
                        break cached;
                    }
                    // The response predates a patch to this collection and
                    // there is no patched page to fall back on.
                    if attempt >= self.retry.attempts() {
                        break entry;
                    }
                    debug!(attempt, "Inline fetch raced a patch, fetching again");
                    attempt += 1;
                }
            }
        };

        Ok(PageRead {
            entry,
            source: ReadSource::Network,
            outdated: false,
        })
    }

    /// Read one entity through the detail cache.
    #[instrument(skip(self, key), fields(collection = %key.collection, id = %key.id))]
    pub async fn detail(&self, key: &DetailKey) -> Result<Entity, FetchError> {
        if let Some(detail) = self.store.get_detail(key)
            && !detail.is_stale()
        {
            return Ok(detail.entity);
        }

        let entity = self.source.fetch_entity(key).await?;
        self.store.set_detail(key.collection.clone(), entity.clone());
        Ok(entity)
    }

    /// Refetch one page with bounded retry.
    ///
    /// On failure the cached page is kept and flagged outdated.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn refetch(&self, key: &CacheKey) -> Result<RefetchOutcome, RefetchError> {
        let attempt = || {
            let ticket = self.store.begin_fetch(key);
            let source = &self.source;
            async move {
                source
                    .fetch_page(key)
                    .await
                    .map(|snapshot| (ticket, snapshot))
            }
        };

        match retry(self.retry, "refetch_page", attempt).await {
            Ok((ticket, snapshot)) => {
                let entry = self.entry_for(key, snapshot);
                match self.store.set_fetched(&ticket, entry) {
                    SetOutcome::Stored => {
                        debug!("Refetched page stored");
                        Ok(RefetchOutcome::Updated)
                    }
                    SetOutcome::Discarded => Ok(RefetchOutcome::Discarded),
                }
            }
            Err(exhausted) => {
                self.store.mark_outdated(key);
                counter!(REFETCH_FAILURE_TOTAL).increment(1);
                let err = RefetchError {
                    key: key.to_string(),
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                };
                warn!(error = %err, "Keeping cached page, flagged outdated");
                Err(err)
            }
        }
    }

    /// Refetch every cached page of a collection concurrently.
    pub async fn refetch_collection(&self, collection: &Collection) -> RefreshSummary {
        let keys = self.store.keys_for(collection);
        let results = join_all(keys.iter().map(|key| self.refetch(key))).await;

        let mut summary = RefreshSummary::default();
        for result in results {
            match result {
                Ok(RefetchOutcome::Updated) => summary.updated += 1,
                Ok(RefetchOutcome::Discarded) => summary.discarded += 1,
                Err(_) => summary.failed += 1,
            }
        }

        debug!(
            collection = %collection,
            updated = summary.updated,
            discarded = summary.discarded,
            failed = summary.failed,
            "Collection refetched"
        );
        summary
    }

    fn spawn_refetch(self: &Arc<Self>, key: CacheKey) {
        if !mutex_lock(&self.in_flight, SOURCE, "spawn_refetch").insert(key.clone()) {
            return;
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are already logged and flagged on the entry.
            let _ = client.refetch(&key).await;
            mutex_lock(&client.in_flight, SOURCE, "refetch_done").remove(&key);
        });
    }

    fn entry_for(&self, key: &CacheKey, snapshot: PageSnapshot) -> CacheEntry {
        let filter = key.filter();
        CacheEntry::new(
            snapshot.items,
            PageInfo {
                page: filter.page(),
                limit: filter.limit(),
                total: snapshot.total,
            },
            OffsetDateTime::now_utc(),
            self.store.stale_after(),
        )
    }
}

#[async_trait]
impl Refresh for QueryClient {
    async fn refresh(&self, collection: &Collection) -> RefreshSummary {
        self.refetch_collection(collection).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::events::MutationEvent;

    struct FakeSource {
        calls: AtomicUsize,
        fail_first: usize,
        items: Vec<Entity>,
    }

    impl FakeSource {
        fn new(ids: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                items: ids.iter().map(|id| entity(id)).collect(),
            }
        }

        fn failing(mut self, times: usize) -> Self {
            self.fail_first = times;
            self
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn fetch_page(&self, _key: &CacheKey) -> Result<PageSnapshot, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(FetchError::Transport("connection refused".to_string()));
            }
            Ok(PageSnapshot {
                items: self.items.clone(),
                total: self.items.len() as u64,
            })
        }

        async fn fetch_entity(&self, key: &DetailKey) -> Result<Entity, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.items
                .iter()
                .find(|item| item.id == key.id)
                .cloned()
                .ok_or(FetchError::Status {
                    status: 404,
                    url: format!("/api/posts/{}", key.id),
                })
        }
    }

    fn entity(id: &str) -> Entity {
        Entity::new(id, format!("post {id}"), "writer", OffsetDateTime::now_utc())
    }

    fn notice() -> Collection {
        Collection::posts("notice")
    }

    fn key() -> CacheKey {
        CacheKey::page(notice(), 1, 10, None)
    }

    fn client(source: FakeSource, config: CacheConfig) -> (Arc<QueryClient>, Arc<FakeSource>) {
        let source = Arc::new(source);
        let store = Arc::new(CacheStore::new(&config));
        let client = Arc::new(QueryClient::new(
            store,
            Arc::clone(&source) as Arc<dyn PageSource>,
            &config,
        ));
        (client, source)
    }

    #[tokio::test]
    async fn miss_fetches_then_hit_serves_from_cache() {
        let (client, source) = client(FakeSource::new(&["a", "b"]), CacheConfig::default());

        let first = client.page(&key()).await.expect("fetch succeeds");
        let second = client.page(&key()).await.expect("cache hit");

        assert_eq!(first.source, ReadSource::Network);
        assert_eq!(second.source, ReadSource::Fresh);
        assert_eq!(second.entry.items.len(), 2);
        assert_eq!(second.entry.page_info.total, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_read_serves_cached_data_and_revalidates() {
        let (client, source) = client(FakeSource::new(&["fresh"]), CacheConfig::default());
        client.store().set(
            key(),
            client.store().entry_now(
                vec![entity("old")],
                PageInfo {
                    page: 1,
                    limit: 10,
                    total: 1,
                },
            ),
        );
        client.store().invalidate(&notice());

        let read = client.page(&key()).await.expect("stale read");
        assert_eq!(read.source, ReadSource::Stale);
        assert_eq!(read.entry.items[0].id.as_str(), "old");

        for _ in 0..50 {
            let idle = client.in_flight.lock().expect("lock").is_empty();
            if source.calls.load(Ordering::SeqCst) > 0 && idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let entry = client.store().get(&key()).expect("cached");
        assert_eq!(entry.items[0].id.as_str(), "fresh");
        assert!(!entry.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_retries_then_succeeds() {
        let (client, source) = client(FakeSource::new(&["a"]).failing(2), CacheConfig::default());

        let outcome = client.refetch(&key()).await.expect("third attempt succeeds");

        assert_eq!(outcome, RefetchOutcome::Updated);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_refetch_keeps_data_and_flags_outdated() {
        let (client, source) =
            client(FakeSource::new(&["new"]).failing(10), CacheConfig::default());
        client.store().set(
            key(),
            client.store().entry_now(
                vec![entity("cached")],
                PageInfo {
                    page: 1,
                    limit: 10,
                    total: 1,
                },
            ),
        );

        let err = client.refetch(&key()).await.expect_err("all attempts fail");

        assert_eq!(err.attempts, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(client.store().is_outdated(&key()));
        let read = client.page(&key()).await.expect("cached data still served");
        assert!(read.outdated);
        assert_eq!(read.entry.items[0].id.as_str(), "cached");
    }

    #[tokio::test]
    async fn refetch_collection_covers_every_cached_page() {
        let (client, source) = client(FakeSource::new(&["a"]), CacheConfig::default());
        for page in 1..=3 {
            client.store().set(
                CacheKey::page(notice(), page, 10, None),
                client.store().entry_now(
                    vec![],
                    PageInfo {
                        page,
                        limit: 10,
                        total: 0,
                    },
                ),
            );
        }

        let summary = client.refresh(&notice()).await;

        assert_eq!(summary.updated, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    /// Serves `Y` once, deleting it through the store mid-request.
    struct DeleteDuringFetch {
        store: Arc<CacheStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageSource for DeleteDuringFetch {
        async fn fetch_page(&self, _key: &CacheKey) -> Result<PageSnapshot, FetchError> {
            let items = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.store
                    .apply(&MutationEvent::deleted(notice(), "Y"))
                    .expect("patch applies");
                vec![entity("a"), entity("Y")]
            } else {
                vec![entity("a")]
            };
            Ok(PageSnapshot {
                total: items.len() as u64,
                items,
            })
        }

        async fn fetch_entity(&self, key: &DetailKey) -> Result<Entity, FetchError> {
            Err(FetchError::Status {
                status: 404,
                url: key.id.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn inline_fetch_racing_a_patch_fetches_again() {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(&config));
        let source = Arc::new(DeleteDuringFetch {
            store: Arc::clone(&store),
            calls: AtomicUsize::new(0),
        });
        let client = Arc::new(QueryClient::new(
            Arc::clone(&store),
            Arc::clone(&source) as Arc<dyn PageSource>,
            &config,
        ));

        let read = client.page(&key()).await.expect("fetch succeeds");

        let ids: Vec<_> = read.entry.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(&key()).map(|entry| entry.items.len()), Some(1));
    }

    #[tokio::test]
    async fn detail_reads_are_cached_until_invalidated() {
        let (client, source) = client(FakeSource::new(&["a"]), CacheConfig::default());
        let detail_key = DetailKey::new(notice(), "a".into());

        client.detail(&detail_key).await.expect("fetched");
        client.detail(&detail_key).await.expect("cached");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        client
            .store()
            .apply(&MutationEvent::updated(notice(), entity("a")))
            .expect("patch applies");
        client.detail(&detail_key).await.expect("refetched");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
