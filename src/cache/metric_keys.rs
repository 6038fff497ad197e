//! Names of the metrics the cache emits through the `metrics` facade.

// Signal intake and dispatch
pub const SIGNAL_DECODED_TOTAL: &str = "boardsync_signal_decoded_total";
pub const SIGNAL_REJECTED_TOTAL: &str = "boardsync_signal_rejected_total";
pub const DISPATCH_MS: &str = "boardsync_dispatch_ms";
pub const LISTENER_FAILURE_TOTAL: &str = "boardsync_listener_failure_total";

// Store
pub const PATCH_FALLBACK_TOTAL: &str = "boardsync_patch_fallback_total";
pub const PAGE_EVICT_TOTAL: &str = "boardsync_cache_page_evict_total";

// Refetch
pub const REFETCH_FAILURE_TOTAL: &str = "boardsync_refetch_failure_total";
pub const REFETCH_DISCARDED_TOTAL: &str = "boardsync_refetch_discarded_total";
