//! Collection index.
//!
//! Tracks which cache keys belong to which collection so that collection-level
//! patches and invalidations touch only the affected keys instead of scanning
//! the whole store.

use std::collections::{BTreeSet, HashMap};

use crate::domain::entities::Collection;

use super::keys::CacheKey;

/// Maps `collection -> set of CacheKey`, maintained incrementally by the store.
///
/// Keys are kept ordered so patches visit pages in a stable order, lowest
/// page number first.
#[derive(Debug, Default)]
pub struct CollectionIndex {
    keys: HashMap<Collection, BTreeSet<CacheKey>>,
}

impl CollectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cached key under its collection.
    pub fn insert(&mut self, key: &CacheKey) {
        self.keys
            .entry(key.collection().clone())
            .or_default()
            .insert(key.clone());
    }

    /// Forget a key, dropping the collection once it has no keys left.
    pub fn remove(&mut self, key: &CacheKey) {
        if let Some(keys) = self.keys.get_mut(key.collection()) {
            keys.remove(key);
            if keys.is_empty() {
                self.keys.remove(key.collection());
            }
        }
    }

    /// All cached keys of a collection.
    pub fn keys_for(&self, collection: &Collection) -> Vec<CacheKey> {
        self.keys
            .get(collection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Collections that currently have at least one cached key.
    pub fn collections(&self) -> Vec<Collection> {
        self.keys.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
