//! Client-side cache consistency for paginated board collections.
//!
//! Mutation responses from the data service carry a small invalidation
//! signal in their headers. [`cache::SignalingTransport`] decodes it,
//! [`cache::InvalidationManager`] patches the [`cache::CacheStore`] and fans
//! the event out to collection-scoped observers, and [`cache::QueryClient`]
//! serves reads cache-first with background revalidation.

pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
