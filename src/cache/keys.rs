//! Cache key definitions.
//!
//! `CacheKey` identifies one cached page of a paginated query; `DetailKey`
//! identifies one cached single-entity read.

use std::fmt;

use crate::domain::entities::{Collection, EntityId};

/// Filter parameters of a paginated list query.
///
/// Built through [`ListFilter::new`] so that logically identical queries
/// always produce identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListFilter {
    page: u32,
    limit: u32,
    search: Option<String>,
}

impl ListFilter {
    /// Pages are 1-based and a limit of zero is treated as one.
    pub fn new(page: u32, limit: u32, search: Option<&str>) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
            search: search.and_then(normalize_search),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn is_first_page(&self) -> bool {
        self.page == 1
    }
}

/// Identifies one cached page: `{collection, filter}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    collection: Collection,
    filter: ListFilter,
}

impl CacheKey {
    pub fn new(collection: Collection, filter: ListFilter) -> Self {
        Self { collection, filter }
    }

    /// Shorthand for a list page with an optional search term.
    pub fn page(collection: Collection, page: u32, limit: u32, search: Option<&str>) -> Self {
        Self::new(collection, ListFilter::new(page, limit, search))
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn filter(&self) -> &ListFilter {
        &self.filter
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}?page={}&limit={}",
            self.collection, self.filter.page, self.filter.limit
        )?;
        if let Some(search) = &self.filter.search {
            write!(f, "&search={search}")?;
        }
        Ok(())
    }
}

/// Identifies one cached single-entity read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetailKey {
    pub collection: Collection,
    pub id: EntityId,
}

impl DetailKey {
    pub fn new(collection: Collection, id: EntityId) -> Self {
        Self { collection, id }
    }
}

/// Trim and lowercase a search term; blank terms mean "no search".
fn normalize_search(search: &str) -> Option<String> {
    let trimmed = search.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}
