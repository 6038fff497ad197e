//! Cache storage.
//!
//! Pages: paginated list snapshots keyed by [`CacheKey`], indexed by collection.
//! Details: single-entity snapshots keyed by [`DetailKey`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::domain::entities::{Collection, Entity, EntityId, PageInfo};

use super::config::CacheConfig;
use super::events::{Epoch, MutationEvent};
use super::keys::{CacheKey, DetailKey};
use super::lock::{rw_read, rw_write};
use super::metric_keys::{PAGE_EVICT_TOTAL, REFETCH_DISCARDED_TOTAL};
use super::patch::{self, PageChange};
use super::registry::CollectionIndex;

const SOURCE: &str = "cache::store";

/// One cached page of a paginated query.
///
/// `stale_at >= fetched_at` always holds. Stale entries are still served;
/// reading one schedules a background refetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub items: Vec<Entity>,
    pub page_info: PageInfo,
    pub fetched_at: OffsetDateTime,
    pub stale_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(
        items: Vec<Entity>,
        page_info: PageInfo,
        fetched_at: OffsetDateTime,
        stale_after: Duration,
    ) -> Self {
        Self {
            items,
            page_info,
            fetched_at,
            stale_at: fetched_at.saturating_add(time_duration(stale_after)),
        }
    }

    pub fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        now >= self.stale_at
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(OffsetDateTime::now_utc())
    }

    /// Expire the entry without discarding its data.
    pub fn mark_stale(&mut self) {
        self.stale_at = self.fetched_at;
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.items.iter().any(|item| &item.id == id)
    }
}

/// One cached single-entity read.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDetail {
    pub entity: Entity,
    pub fetched_at: OffsetDateTime,
    pub stale_at: OffsetDateTime,
}

impl CachedDetail {
    pub fn is_stale(&self) -> bool {
        OffsetDateTime::now_utc() >= self.stale_at
    }
}

/// Taken before a refetch goes to the network; see [`CacheStore::set_fetched`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: CacheKey,
    pub revision: Epoch,
}

/// Whether a fetched page made it into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// The cached page already reflects a newer revision than the fetch.
    Discarded,
}

/// Summary of a collection patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchReport {
    /// Cached pages of the collection the transform ran on.
    pub pages_visited: usize,
    /// Pages the transform actually modified.
    pub pages_changed: usize,
    /// Revision stamped on the visited pages.
    pub revision: Option<Epoch>,
}

/// A patch could not be applied cleanly; the caller falls back to invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchReconciliationError {
    #[error("cache key `{key}` is indexed under `{collection}` but holds no page")]
    MissingEntry { collection: Collection, key: String },
    #[error("update of `{id}` in `{collection}` carries no entity snapshot")]
    MissingSnapshot { collection: Collection, id: EntityId },
}

#[derive(Debug)]
struct StoredPage {
    entry: CacheEntry,
    /// Newest store revision the data reflects: the ticket it was fetched
    /// under, or the last patch or invalidation applied on top of it.
    revision: Epoch,
    /// The last background refetch for this page gave up.
    outdated: bool,
}

impl StoredPage {
    fn fresh(entry: CacheEntry, revision: Epoch) -> Self {
        Self {
            entry,
            revision,
            outdated: false,
        }
    }
}

struct PageState {
    pages: LruCache<CacheKey, StoredPage>,
    index: CollectionIndex,
    /// Last patch or invalidation revision per collection. Outlives evicted
    /// pages, so a fetch for a page that is no longer cached is still
    /// checked against mutations it never saw.
    floors: HashMap<Collection, Epoch>,
}

impl PageState {
    /// Oldest ticket revision a fetch for `key` may carry and still be stored.
    fn floor(&self, key: &CacheKey) -> Epoch {
        let collection_floor = self.floors.get(key.collection()).copied().unwrap_or(0);
        self.pages
            .peek(key)
            .map_or(collection_floor, |page| page.revision.max(collection_floor))
    }

    fn raise_floor(&mut self, collection: &Collection, revision: Epoch) {
        let floor = self.floors.entry(collection.clone()).or_insert(revision);
        *floor = (*floor).max(revision);
    }

    fn insert(&mut self, key: CacheKey, page: StoredPage) {
        self.index.insert(&key);
        if let Some((evicted, _)) = self.pages.push(key.clone(), page)
            && evicted != key
        {
            self.index.remove(&evicted);
            counter!(PAGE_EVICT_TOTAL).increment(1);
            debug!(key = %evicted, "Evicted cached page");
        }
    }
}

/// Client-side store of paginated collection snapshots.
///
/// Every operation is synchronous and never panics past its caller.
pub struct CacheStore {
    stale_after: Duration,
    pages: RwLock<PageState>,
    details: RwLock<LruCache<DetailKey, CachedDetail>>,
    revision: AtomicU64,
}

impl CacheStore {
    /// Create a new store with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            pages: RwLock::new(PageState {
                pages: LruCache::new(config.page_entry_limit_non_zero()),
                index: CollectionIndex::new(),
                floors: HashMap::new(),
            }),
            details: RwLock::new(LruCache::new(config.detail_entry_limit_non_zero())),
            revision: AtomicU64::new(0),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Build an entry fetched now with this store's freshness window.
    pub fn entry_now(&self, items: Vec<Entity>, page_info: PageInfo) -> CacheEntry {
        CacheEntry::new(items, page_info, OffsetDateTime::now_utc(), self.stale_after)
    }

    // ========================================================================
    // Pages
    // ========================================================================

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        rw_write(&self.pages, SOURCE, "get")
            .pages
            .get(key)
            .map(|page| page.entry.clone())
    }

    /// Store a page unconditionally and index it under its collection.
    pub fn set(&self, key: CacheKey, entry: CacheEntry) {
        let mut state = rw_write(&self.pages, SOURCE, "set");
        let revision = self.revision.load(Ordering::SeqCst);
        state.insert(key, StoredPage::fresh(entry, revision));
    }

    /// Tag a refetch with the store's current revision.
    pub fn begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        FetchTicket {
            key: key.clone(),
            revision: self.revision.load(Ordering::SeqCst),
        }
    }

    /// Store a fetched page unless the cache already holds newer data for it.
    ///
    /// A response is discarded when its ticket predates a patch or
    /// invalidation of the collection, or predates the ticket of a fetch
    /// that was already stored for the same key.
    pub fn set_fetched(&self, ticket: &FetchTicket, entry: CacheEntry) -> SetOutcome {
        let mut state = rw_write(&self.pages, SOURCE, "set_fetched");

        let floor = state.floor(&ticket.key);
        if floor > ticket.revision {
            counter!(REFETCH_DISCARDED_TOTAL).increment(1);
            debug!(
                key = %ticket.key,
                ticket_revision = ticket.revision,
                floor,
                "Discarded fetch older than cached data"
            );
            return SetOutcome::Discarded;
        }

        state.insert(ticket.key.clone(), StoredPage::fresh(entry, ticket.revision));
        SetOutcome::Stored
    }

    /// Mark every page of the collection stale, keeping its data.
    ///
    /// Returns the number of pages marked.
    pub fn invalidate(&self, collection: &Collection) -> usize {
        let mut state = rw_write(&self.pages, SOURCE, "invalidate");
        let revision = self.next_revision();
        state.raise_floor(collection, revision);
        let PageState { pages, index, .. } = &mut *state;

        let mut marked = 0;
        for key in index.keys_for(collection) {
            if let Some(page) = pages.peek_mut(&key) {
                page.entry.mark_stale();
                page.revision = revision;
                marked += 1;
            }
        }

        debug!(collection = %collection, marked, revision, "Invalidated collection");
        marked
    }

    /// Apply `transform` to every cached page of the collection.
    ///
    /// A collection with nothing cached is a no-op. Every visited page is
    /// stamped with a fresh revision, and so is the collection, so that
    /// fetches begun before the patch are discarded.
    pub fn patch<F>(
        &self,
        collection: &Collection,
        mut transform: F,
    ) -> Result<PatchReport, PatchReconciliationError>
    where
        F: FnMut(&CacheKey, &mut CacheEntry) -> PageChange,
    {
        let mut state = rw_write(&self.pages, SOURCE, "patch");
        let revision = self.next_revision();
        state.raise_floor(collection, revision);
        let PageState { pages, index, .. } = &mut *state;

        let keys = index.keys_for(collection);
        if keys.is_empty() {
            return Ok(PatchReport::default());
        }

        let mut report = PatchReport::default();
        let mut missing = None;

        for key in keys {
            let Some(page) = pages.peek_mut(&key) else {
                index.remove(&key);
                missing.get_or_insert(key);
                continue;
            };

            report.pages_visited += 1;
            page.revision = revision;
            if !transform(&key, &mut page.entry).is_noop() {
                report.pages_changed += 1;
            }
        }

        if let Some(key) = missing {
            return Err(PatchReconciliationError::MissingEntry {
                collection: collection.clone(),
                key: key.to_string(),
            });
        }

        if report.pages_visited > 0 {
            report.revision = Some(revision);
        }
        Ok(report)
    }

    /// Apply the optimistic patch for a mutation event.
    pub fn apply(&self, event: &MutationEvent) -> Result<PatchReport, PatchReconciliationError> {
        match event {
            MutationEvent::Created { collection, entity } => {
                self.patch(collection, |key, entry| {
                    if key.filter().is_first_page() {
                        patch::prepend_created(entry, entity)
                    } else {
                        PageChange::default()
                    }
                })
            }
            MutationEvent::Updated {
                collection,
                id,
                snapshot,
            } => {
                self.invalidate_detail(&DetailKey::new(collection.clone(), id.clone()));
                let Some(entity) = snapshot else {
                    return Err(PatchReconciliationError::MissingSnapshot {
                        collection: collection.clone(),
                        id: id.clone(),
                    });
                };
                self.patch(collection, |_, entry| patch::replace_updated(entry, entity))
            }
            MutationEvent::Deleted { collection, id } => {
                self.remove_detail(&DetailKey::new(collection.clone(), id.clone()));
                self.patch(collection, |_, entry| patch::remove_deleted(entry, id))
            }
        }
    }

    /// Keys currently cached for a collection.
    pub fn keys_for(&self, collection: &Collection) -> Vec<CacheKey> {
        rw_read(&self.pages, SOURCE, "keys_for")
            .index
            .keys_for(collection)
    }

    /// Collections with at least one cached page.
    pub fn collections(&self) -> Vec<Collection> {
        rw_read(&self.pages, SOURCE, "collections").index.collections()
    }

    /// Flag a page whose background refetch gave up.
    pub fn mark_outdated(&self, key: &CacheKey) {
        if let Some(page) = rw_write(&self.pages, SOURCE, "mark_outdated")
            .pages
            .peek_mut(key)
        {
            page.outdated = true;
        }
    }

    /// Whether the page's data may be outdated after a failed refetch.
    pub fn is_outdated(&self, key: &CacheKey) -> bool {
        rw_read(&self.pages, SOURCE, "is_outdated")
            .pages
            .peek(key)
            .is_some_and(|page| page.outdated)
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        rw_read(&self.pages, SOURCE, "len").pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Details
    // ========================================================================

    pub fn get_detail(&self, key: &DetailKey) -> Option<CachedDetail> {
        rw_write(&self.details, SOURCE, "get_detail")
            .get(key)
            .cloned()
    }

    pub fn set_detail(&self, collection: Collection, entity: Entity) {
        let fetched_at = OffsetDateTime::now_utc();
        let key = DetailKey::new(collection, entity.id.clone());
        let detail = CachedDetail {
            entity,
            fetched_at,
            stale_at: fetched_at.saturating_add(time_duration(self.stale_after)),
        };
        rw_write(&self.details, SOURCE, "set_detail").put(key, detail);
    }

    /// Expire a detail entry without discarding it.
    pub fn invalidate_detail(&self, key: &DetailKey) {
        if let Some(detail) = rw_write(&self.details, SOURCE, "invalidate_detail").peek_mut(key) {
            detail.stale_at = detail.fetched_at;
        }
    }

    pub fn remove_detail(&self, key: &DetailKey) {
        rw_write(&self.details, SOURCE, "remove_detail").pop(key);
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Clear all cached data.
    pub fn clear(&self) {
        let mut state = rw_write(&self.pages, SOURCE, "clear.pages");
        state.pages.clear();
        state.index.clear();
        state.floors.clear();
        drop(state);
        rw_write(&self.details, SOURCE, "clear.details").clear();
    }

    fn next_revision(&self) -> Epoch {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn time_duration(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn entity(id: &str) -> Entity {
        Entity::new(id, format!("post {id}"), "writer", OffsetDateTime::now_utc())
    }

    fn notice() -> Collection {
        Collection::posts("notice")
    }

    fn key(page: u32) -> CacheKey {
        CacheKey::page(notice(), page, 3, None)
    }

    fn seed(store: &CacheStore, page: u32, ids: &[&str], total: u64) {
        store.set(
            key(page),
            store.entry_now(
                ids.iter().map(|id| entity(id)).collect(),
                PageInfo {
                    page,
                    limit: 3,
                    total,
                },
            ),
        );
    }

    fn ids(store: &CacheStore, page: u32) -> Vec<String> {
        store
            .get(&key(page))
            .expect("page should be cached")
            .items
            .iter()
            .map(|item| item.id.to_string())
            .collect()
    }

    #[test]
    fn entry_freshness_window() {
        let fetched_at = OffsetDateTime::now_utc();
        let mut entry = CacheEntry::new(
            vec![],
            PageInfo {
                page: 1,
                limit: 10,
                total: 0,
            },
            fetched_at,
            Duration::from_secs(30),
        );

        assert!(entry.stale_at >= entry.fetched_at);
        assert!(!entry.is_stale_at(fetched_at));
        assert!(entry.is_stale_at(fetched_at + time::Duration::seconds(30)));

        entry.mark_stale();
        assert_eq!(entry.stale_at, entry.fetched_at);
        assert!(entry.is_stale_at(fetched_at));
    }

    #[test]
    fn set_indexes_keys_by_collection() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);
        seed(&store, 2, &["b"], 1);

        assert_eq!(store.keys_for(&notice()), vec![key(1), key(2)]);
        assert_eq!(store.collections(), vec![notice()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn eviction_removes_key_from_index() {
        let config = CacheConfig {
            page_entry_limit: 1,
            ..Default::default()
        };
        let store = CacheStore::new(&config);
        seed(&store, 1, &["a"], 1);
        seed(&store, 2, &["b"], 1);

        assert!(store.get(&key(1)).is_none());
        assert_eq!(store.keys_for(&notice()), vec![key(2)]);
    }

    #[test]
    fn invalidate_marks_stale_but_keeps_data() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a", "b"], 2);

        assert_eq!(store.invalidate(&notice()), 1);

        let entry = store.get(&key(1)).expect("data kept");
        assert!(entry.is_stale());
        assert_eq!(entry.items.len(), 2);
    }

    #[test]
    fn patch_without_cached_pages_is_noop() {
        let store = CacheStore::new(&CacheConfig::default());
        let report = store
            .apply(&MutationEvent::created(notice(), entity("x")))
            .expect("no-op is not an error");
        assert_eq!(report, PatchReport::default());
        assert!(store.is_empty());
    }

    #[test]
    fn create_touches_first_page_only() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["c", "b", "a"], 5);
        seed(&store, 2, &["z", "y"], 5);

        let report = store
            .apply(&MutationEvent::created(notice(), entity("d")))
            .expect("patch applies");

        assert_eq!(report.pages_visited, 2);
        assert_eq!(report.pages_changed, 1);
        assert_eq!(ids(&store, 1), vec!["d", "c", "b"]);
        assert_eq!(ids(&store, 2), vec!["z", "y"]);
        assert_eq!(store.get(&key(1)).map(|e| e.page_info.total), Some(6));
        assert_eq!(store.get(&key(2)).map(|e| e.page_info.total), Some(5));
    }

    #[test]
    fn create_patches_every_first_page_variant() {
        let store = CacheStore::new(&CacheConfig::default());
        let search_key = CacheKey::page(notice(), 1, 3, Some("hours"));
        seed(&store, 1, &["a"], 1);
        store.set(
            search_key.clone(),
            store.entry_now(
                vec![entity("s")],
                PageInfo {
                    page: 1,
                    limit: 3,
                    total: 1,
                },
            ),
        );

        store
            .apply(&MutationEvent::created(notice(), entity("n")))
            .expect("patch applies");

        let searched = store.get(&search_key).expect("cached");
        assert_eq!(searched.items[0].id.as_str(), "n");
        assert_eq!(ids(&store, 1), vec!["n", "a"]);
    }

    #[test]
    fn update_replaces_on_every_page_and_expires_detail() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a", "b"], 2);
        store.set_detail(notice(), entity("b"));

        let mut edited = entity("b");
        edited.title = "edited".to_string();
        store
            .apply(&MutationEvent::updated(notice(), edited))
            .expect("patch applies");

        let page = store.get(&key(1)).expect("cached");
        assert_eq!(page.items[1].title, "edited");
        let detail = store
            .get_detail(&DetailKey::new(notice(), EntityId::new("b")))
            .expect("detail kept");
        assert!(detail.is_stale());
    }

    #[test]
    fn update_without_snapshot_is_reconciliation_error() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);

        let event = MutationEvent::Updated {
            collection: notice(),
            id: EntityId::new("a"),
            snapshot: None,
        };
        let err = store.apply(&event).expect_err("cannot patch in place");
        assert!(matches!(
            err,
            PatchReconciliationError::MissingSnapshot { .. }
        ));
    }

    #[test]
    fn delete_on_second_page_leaves_first_page_untouched() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["c", "b", "a"], 5);
        seed(&store, 2, &["Y", "z"], 5);
        store.set_detail(notice(), entity("Y"));
        let first_before = store.get(&key(1));

        store
            .apply(&MutationEvent::deleted(notice(), "Y"))
            .expect("patch applies");

        assert_eq!(store.get(&key(1)), first_before);
        assert_eq!(ids(&store, 2), vec!["z"]);
        assert_eq!(store.get(&key(2)).map(|e| e.page_info.total), Some(4));
        assert!(
            store
                .get_detail(&DetailKey::new(notice(), EntityId::new("Y")))
                .is_none()
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a", "b"], 2);

        store
            .apply(&MutationEvent::deleted(notice(), "a"))
            .expect("patch applies");
        let after_first = store.get(&key(1));

        let report = store
            .apply(&MutationEvent::deleted(notice(), "a"))
            .expect("patch applies");

        assert_eq!(report.pages_changed, 0);
        assert_eq!(store.get(&key(1)), after_first);
    }

    #[test]
    fn refetch_older_than_patch_is_discarded() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);

        let ticket = store.begin_fetch(&key(1));
        let mut edited = entity("a");
        edited.title = "edited".to_string();
        store
            .apply(&MutationEvent::updated(notice(), edited))
            .expect("patch applies");

        let stale_response = store.entry_now(
            vec![entity("a")],
            PageInfo {
                page: 1,
                limit: 3,
                total: 1,
            },
        );
        assert_eq!(
            store.set_fetched(&ticket, stale_response),
            SetOutcome::Discarded
        );
        assert_eq!(
            store.get(&key(1)).map(|e| e.items[0].title.clone()),
            Some("edited".to_string())
        );
    }

    #[test]
    fn refetch_started_after_patch_is_stored() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);
        store
            .apply(&MutationEvent::deleted(notice(), "a"))
            .expect("patch applies");

        let ticket = store.begin_fetch(&key(1));
        let response = store.entry_now(
            vec![entity("b")],
            PageInfo {
                page: 1,
                limit: 3,
                total: 1,
            },
        );

        assert_eq!(store.set_fetched(&ticket, response), SetOutcome::Stored);
        assert_eq!(ids(&store, 1), vec!["b"]);
    }

    #[test]
    fn overlapping_fetch_older_than_stored_one_is_discarded() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a", "Y"], 2);

        let slow = store.begin_fetch(&key(1));
        store
            .apply(&MutationEvent::deleted(notice(), "Y"))
            .expect("patch applies");
        let fast = store.begin_fetch(&key(1));

        let page = |ids: &[&str]| {
            store.entry_now(
                ids.iter().map(|id| entity(id)).collect(),
                PageInfo {
                    page: 1,
                    limit: 3,
                    total: ids.len() as u64,
                },
            )
        };

        assert_eq!(store.set_fetched(&fast, page(&["a"])), SetOutcome::Stored);
        assert_eq!(
            store.set_fetched(&slow, page(&["a", "Y"])),
            SetOutcome::Discarded
        );
        assert_eq!(ids(&store, 1), vec!["a"]);
    }

    #[test]
    fn fetch_for_evicted_page_still_respects_patches() {
        let config = CacheConfig {
            page_entry_limit: 1,
            ..Default::default()
        };
        let store = CacheStore::new(&config);
        seed(&store, 1, &["a", "Y"], 2);

        let ticket = store.begin_fetch(&key(1));
        store
            .apply(&MutationEvent::deleted(notice(), "Y"))
            .expect("patch applies");
        seed(&store, 2, &["b"], 2);
        assert!(store.get(&key(1)).is_none());

        let response = store.entry_now(
            vec![entity("a"), entity("Y")],
            PageInfo {
                page: 1,
                limit: 3,
                total: 2,
            },
        );
        assert_eq!(store.set_fetched(&ticket, response), SetOutcome::Discarded);
        assert!(store.get(&key(1)).is_none());
    }

    #[test]
    fn fetch_racing_patch_of_uncached_collection_is_discarded() {
        let store = CacheStore::new(&CacheConfig::default());

        let ticket = store.begin_fetch(&key(1));
        let report = store
            .apply(&MutationEvent::deleted(notice(), "Y"))
            .expect("no-op is not an error");
        assert_eq!(report, PatchReport::default());

        let response = store.entry_now(
            vec![entity("Y")],
            PageInfo {
                page: 1,
                limit: 3,
                total: 1,
            },
        );
        assert_eq!(store.set_fetched(&ticket, response), SetOutcome::Discarded);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_fetches_without_patches_are_both_stored() {
        let store = CacheStore::new(&CacheConfig::default());
        let first = store.begin_fetch(&key(1));
        let second = store.begin_fetch(&key(1));
        let response = store.entry_now(
            vec![entity("a")],
            PageInfo {
                page: 1,
                limit: 3,
                total: 1,
            },
        );

        assert_eq!(
            store.set_fetched(&second, response.clone()),
            SetOutcome::Stored
        );
        assert_eq!(store.set_fetched(&first, response), SetOutcome::Stored);
    }

    #[test]
    fn successful_set_clears_outdated_flag() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);

        store.mark_outdated(&key(1));
        assert!(store.is_outdated(&key(1)));

        seed(&store, 1, &["a"], 1);
        assert!(!store.is_outdated(&key(1)));
    }

    #[test]
    fn clear_drops_pages_and_details() {
        let store = CacheStore::new(&CacheConfig::default());
        seed(&store, 1, &["a"], 1);
        store.set_detail(notice(), entity("a"));

        store.clear();

        assert!(store.is_empty());
        assert!(store.collections().is_empty());
        assert!(
            store
                .get_detail(&DetailKey::new(notice(), EntityId::new("a")))
                .is_none()
        );
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = CacheStore::new(&CacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.pages.write().expect("pages lock should be acquired");
            panic!("poison pages lock");
        }));

        seed(&store, 1, &["a"], 1);
        assert_eq!(ids(&store, 1), vec!["a"]);
    }
}
