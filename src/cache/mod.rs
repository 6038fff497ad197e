//! Client-side cache consistency.
//!
//! Keeps cached, paginated views of server-owned collections correct as
//! mutation signals arrive:
//!
//! - **Store**: paged snapshots plus single-entity details, indexed by collection
//! - **Signal codec**: the `x-revalidated-marker` / `x-invalidation-*` headers
//! - **Manager**: decode → optimistic patch → listener fan-out
//! - **Transport**: decorator feeding every response's signal to the manager
//! - **Observers**: badge, coalesced auto-refresh, polling safety net
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `boardsync.toml`:
//!
//! ```toml
//! [cache]
//! page_entry_limit = 200
//! stale_after_secs = 30
//! poll_interval_secs = 300
//! # ... see config.rs for all options
//! ```

mod config;
mod events;
mod keys;
mod lock;
mod manager;
pub mod metric_keys;
mod observers;
mod patch;
mod query;
mod registry;
mod retry;
pub mod signal;
mod store;
mod transport;

pub use config::CacheConfig;
pub use events::{Epoch, EventKind, MutationEvent};
pub use keys::{CacheKey, DetailKey, ListFilter};
pub use manager::{
    DispatchReport, InvalidationManager, ListenerError, Liveness, PatchOutcome, Subscription,
};
pub use observers::{AutoRefresh, NotificationBadge, PollingSafetyNet, log_events};
pub use patch::PageChange;
pub use query::{
    FetchError, PageRead, PageSnapshot, PageSource, QueryClient, ReadSource, Refresh,
    RefetchError, RefetchOutcome, RefreshSummary,
};
pub use registry::CollectionIndex;
pub use retry::{Exhausted, RetryPolicy, retry};
pub use signal::{SignalDecodeError, SignalEncodeError};
pub use store::{
    CacheEntry, CacheStore, CachedDetail, FetchTicket, PatchReconciliationError, PatchReport,
    SetOutcome,
};
pub use transport::{SignalCarrier, SignalingTransport, Transport};
