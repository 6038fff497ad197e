//! Optimistic page patches.
//!
//! Pure transforms applied to one cached page. The store decides which pages
//! each transform runs on; these functions only keep a single page's
//! ordering, size and count invariants.

use crate::domain::entities::{Entity, EntityId};

use super::store::CacheEntry;

/// What a patch did to one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageChange {
    /// The entity was prepended.
    pub inserted: bool,
    /// Entities replaced in place.
    pub replaced: usize,
    /// Entities removed.
    pub removed: usize,
    /// The last item was dropped to keep the page within its limit.
    pub truncated: bool,
}

impl PageChange {
    pub fn is_noop(&self) -> bool {
        !self.inserted && self.replaced == 0 && self.removed == 0 && !self.truncated
    }
}

/// Prepend a created entity to a first page.
///
/// Increments `total`, then drops the last item if the page outgrew its limit.
/// A replayed create for an id already on the page replaces it in place and
/// leaves `total` alone.
pub fn prepend_created(entry: &mut CacheEntry, entity: &Entity) -> PageChange {
    if let Some(position) = entry.items.iter().position(|item| item.id == entity.id) {
        entry.items[position] = entity.clone();
        return PageChange {
            replaced: 1,
            ..PageChange::default()
        };
    }

    entry.items.insert(0, entity.clone());
    entry.page_info.total = entry.page_info.total.saturating_add(1);

    let limit = entry.page_info.limit as usize;
    let truncated = entry.items.len() > limit;
    if truncated {
        entry.items.truncate(limit);
    }

    PageChange {
        inserted: true,
        truncated,
        ..PageChange::default()
    }
}

/// Replace every occurrence of the entity in place.
pub fn replace_updated(entry: &mut CacheEntry, entity: &Entity) -> PageChange {
    let mut replaced = 0;
    for item in entry.items.iter_mut().filter(|item| item.id == entity.id) {
        *item = entity.clone();
        replaced += 1;
    }

    PageChange {
        replaced,
        ..PageChange::default()
    }
}

/// Remove the entity and decrement `total` (floored at zero) if it was here.
pub fn remove_deleted(entry: &mut CacheEntry, id: &EntityId) -> PageChange {
    let before = entry.items.len();
    entry.items.retain(|item| &item.id != id);
    let removed = before - entry.items.len();

    if removed > 0 {
        entry.page_info.total = entry.page_info.total.saturating_sub(1);
    }

    PageChange {
        removed,
        ..PageChange::default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;
    use crate::domain::entities::PageInfo;

    fn entity(id: &str) -> Entity {
        Entity::new(id, format!("post {id}"), "writer", OffsetDateTime::now_utc())
    }

    fn page(ids: &[&str], page: u32, limit: u32, total: u64) -> CacheEntry {
        CacheEntry::new(
            ids.iter().map(|id| entity(id)).collect(),
            PageInfo { page, limit, total },
            OffsetDateTime::now_utc(),
            Duration::from_secs(30),
        )
    }

    fn ids(entry: &CacheEntry) -> Vec<&str> {
        entry.items.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn create_on_full_page_drops_last_item() {
        let originals: Vec<String> = (0..10).map(|n| n.to_string()).collect();
        let refs: Vec<&str> = originals.iter().map(String::as_str).collect();
        let mut entry = page(&refs, 1, 10, 25);

        let change = prepend_created(&mut entry, &entity("X"));

        assert!(change.inserted);
        assert!(change.truncated);
        assert_eq!(entry.items.len(), 10);
        assert_eq!(ids(&entry)[0], "X");
        assert_eq!(&ids(&entry)[1..], &refs[..9]);
        assert_eq!(entry.page_info.total, 26);
    }

    #[test]
    fn create_on_partial_page_keeps_every_item() {
        let mut entry = page(&["a", "b"], 1, 10, 2);

        let change = prepend_created(&mut entry, &entity("c"));

        assert!(!change.truncated);
        assert_eq!(ids(&entry), vec!["c", "a", "b"]);
        assert_eq!(entry.page_info.total, 3);
    }

    #[test]
    fn replayed_create_does_not_duplicate() {
        let mut entry = page(&["a", "b"], 1, 10, 2);

        let mut renamed = entity("b");
        renamed.title = "renamed".to_string();
        let change = prepend_created(&mut entry, &renamed);

        assert_eq!(change.replaced, 1);
        assert!(!change.inserted);
        assert_eq!(ids(&entry), vec!["a", "b"]);
        assert_eq!(entry.items[1].title, "renamed");
        assert_eq!(entry.page_info.total, 2);
    }

    #[test]
    fn update_preserves_position() {
        let mut entry = page(&["a", "b", "c"], 1, 10, 3);
        let mut changed = entity("b");
        changed.title = "edited".to_string();

        let change = replace_updated(&mut entry, &changed);

        assert_eq!(change.replaced, 1);
        assert_eq!(ids(&entry), vec!["a", "b", "c"]);
        assert_eq!(entry.items[1].title, "edited");
        assert_eq!(entry.page_info.total, 3);
    }

    #[test]
    fn update_for_absent_id_is_noop() {
        let mut entry = page(&["a"], 1, 10, 1);
        assert!(replace_updated(&mut entry, &entity("z")).is_noop());
    }

    #[test]
    fn delete_removes_and_decrements() {
        let mut entry = page(&["a", "b", "c"], 2, 10, 13);

        let change = remove_deleted(&mut entry, &EntityId::new("b"));

        assert_eq!(change.removed, 1);
        assert_eq!(ids(&entry), vec!["a", "c"]);
        assert_eq!(entry.page_info.total, 12);
    }

    #[test]
    fn delete_of_absent_id_is_noop() {
        let mut entry = page(&["a"], 1, 10, 1);
        let before = entry.clone();

        let change = remove_deleted(&mut entry, &EntityId::new("ghost"));

        assert!(change.is_noop());
        assert_eq!(entry, before);
    }

    #[test]
    fn delete_total_floors_at_zero() {
        let mut entry = page(&["a"], 1, 10, 0);
        remove_deleted(&mut entry, &EntityId::new("a"));
        assert_eq!(entry.page_info.total, 0);
    }
}
