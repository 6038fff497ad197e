//! Cache configuration.
//!
//! Controls store capacity, freshness, observer timing and refetch retries via
//! the `[cache]` table of `boardsync.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::retry::RetryPolicy;

// Default values for cache configuration
const DEFAULT_PAGE_ENTRY_LIMIT: usize = 200;
const DEFAULT_DETAIL_ENTRY_LIMIT: usize = 500;
const DEFAULT_STALE_AFTER_SECS: u64 = 30;
const DEFAULT_AUTO_REFRESH_MIN_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_REFETCH_ATTEMPTS: u32 = 3;
const DEFAULT_REFETCH_BACKOFF_MS: u64 = 250;

/// Cache configuration from `boardsync.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Apply optimistic patches and fan out events. When off, signals are
    /// still decoded but only logged.
    pub enabled: bool,
    /// Maximum cached list pages (LRU).
    pub page_entry_limit: usize,
    /// Maximum cached single-entity details (LRU).
    pub detail_entry_limit: usize,
    /// Seconds before a fetched page is considered stale.
    pub stale_after_secs: u64,
    /// Minimum delay (ms) between an event and the coalesced auto-refresh.
    pub auto_refresh_min_interval_ms: u64,
    /// Polling safety-net interval (s) for missed signals.
    pub poll_interval_secs: u64,
    /// Attempts per background refetch before giving up.
    pub refetch_attempts: u32,
    /// Base delay (ms) of the exponential refetch backoff.
    pub refetch_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_entry_limit: DEFAULT_PAGE_ENTRY_LIMIT,
            detail_entry_limit: DEFAULT_DETAIL_ENTRY_LIMIT,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            auto_refresh_min_interval_ms: DEFAULT_AUTO_REFRESH_MIN_INTERVAL_MS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            refetch_attempts: DEFAULT_REFETCH_ATTEMPTS,
            refetch_backoff_ms: DEFAULT_REFETCH_BACKOFF_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            page_entry_limit: settings.page_entry_limit.get(),
            detail_entry_limit: settings.detail_entry_limit.get(),
            stale_after_secs: settings.stale_after.as_secs(),
            auto_refresh_min_interval_ms: duration_millis(settings.auto_refresh_min_interval),
            poll_interval_secs: settings.poll_interval.as_secs(),
            refetch_attempts: settings.refetch_attempts.get(),
            refetch_backoff_ms: duration_millis(settings.refetch_backoff),
        }
    }
}

impl CacheConfig {
    /// Returns the page entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn page_entry_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.page_entry_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the detail entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn detail_entry_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.detail_entry_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn auto_refresh_min_interval(&self) -> Duration {
        Duration::from_millis(self.auto_refresh_min_interval_ms)
    }

    /// Polling interval, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.refetch_attempts,
            Duration::from_millis(self.refetch_backoff_ms),
        )
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
