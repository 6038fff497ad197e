//! Invalidation manager.
//!
//! Session-scoped hub between the signal codec, the store and listeners. Each
//! dispatch runs in three phases:
//!
//! 1. **Patch**: apply the event's optimistic patch, falling back to
//!    invalidating the collection if the patch cannot be reconciled.
//! 2. **Snapshot**: copy the listeners scoped to the collection, in
//!    registration order, then release the registry lock.
//! 3. **Fan-out**: invoke each listener that is still subscribed, isolating
//!    panics per listener.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::domain::entities::Collection;

use super::config::CacheConfig;
use super::events::{Epoch, MutationEvent};
use super::lock::mutex_lock;
use super::metric_keys::{
    DISPATCH_MS, LISTENER_FAILURE_TOTAL, PATCH_FALLBACK_TOTAL, SIGNAL_DECODED_TOTAL,
    SIGNAL_REJECTED_TOTAL,
};
use super::signal::{self, SignalDecodeError};
use super::store::{CacheStore, PatchReconciliationError, PatchReport};

const SOURCE: &str = "cache::manager";

type Callback = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

/// A listener panicked while handling an event.
#[derive(Debug, Clone, Error)]
#[error("listener {listener_id} on `{collection}` panicked: {message}")]
pub struct ListenerError {
    pub listener_id: u64,
    pub collection: Collection,
    pub message: String,
}

/// What the patch phase of a dispatch did.
#[derive(Debug, Clone)]
pub enum PatchOutcome {
    Applied(PatchReport),
    /// The patch could not be reconciled; the collection was invalidated.
    FellBack {
        reason: PatchReconciliationError,
        invalidated: usize,
    },
    /// Caching is disabled or the manager was disposed.
    Skipped,
}

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: Uuid,
    pub epoch: Epoch,
    pub patch: PatchOutcome,
    /// Listeners that handled the event.
    pub delivered: usize,
    /// Listeners that panicked.
    pub failed: Vec<ListenerError>,
}

/// Liveness of a subscription, shareable with async work done on its behalf.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`InvalidationManager::subscribe`].
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    listener_id: u64,
    collection: Collection,
    active: Arc<AtomicBool>,
    manager: Weak<InvalidationManager>,
}

impl Subscription {
    /// Stop delivery, including for dispatches already in progress.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_listener(self.listener_id);
        }
        debug!(
            listener_id = self.listener_id,
            collection = %self.collection,
            "Listener unsubscribed"
        );
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn liveness(&self) -> Liveness {
        Liveness(Arc::clone(&self.active))
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct ListenerSlot {
    id: u64,
    collection: Collection,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Turns mutation signals into store patches and listener notifications.
pub struct InvalidationManager {
    config: CacheConfig,
    store: Arc<CacheStore>,
    listeners: Mutex<Vec<ListenerSlot>>,
    next_listener_id: AtomicU64,
    epoch: AtomicU64,
    disposed: AtomicBool,
}

impl InvalidationManager {
    /// Start a session with a fresh store.
    pub fn init(config: CacheConfig) -> Arc<Self> {
        let store = Arc::new(CacheStore::new(&config));
        Self::with_store(config, store)
    }

    /// Start a session around an existing store.
    pub fn with_store(config: CacheConfig, store: Arc<CacheStore>) -> Arc<Self> {
        info!(
            enabled = config.enabled,
            page_entry_limit = config.page_entry_limit,
            detail_entry_limit = config.detail_entry_limit,
            "Invalidation manager initialised"
        );
        Arc::new(Self {
            config,
            store,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Register a listener for events of one collection.
    pub fn subscribe<F>(self: &Arc<Self>, collection: Collection, callback: F) -> Subscription
    where
        F: Fn(&MutationEvent) + Send + Sync + 'static,
    {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(!self.is_disposed()));

        if active.load(Ordering::SeqCst) {
            mutex_lock(&self.listeners, SOURCE, "subscribe").push(ListenerSlot {
                id: listener_id,
                collection: collection.clone(),
                active: Arc::clone(&active),
                callback: Arc::new(callback),
            });
            debug!(listener_id, collection = %collection, "Listener subscribed");
        } else {
            warn!(collection = %collection, "Subscribe after dispose ignored");
        }

        Subscription {
            listener_id,
            collection,
            active,
            manager: Arc::downgrade(self),
        }
    }

    /// Number of listeners currently registered for a collection.
    pub fn listener_count(&self, collection: &Collection) -> usize {
        mutex_lock(&self.listeners, SOURCE, "listener_count")
            .iter()
            .filter(|slot| &slot.collection == collection)
            .count()
    }

    /// Decode the signal carried by response headers and dispatch it.
    ///
    /// Returns `None` when there is no signal or the signal is malformed;
    /// malformed signals are logged and dropped.
    pub fn dispatch_signal(&self, headers: &HeaderMap) -> Option<DispatchReport> {
        match signal::decode(headers) {
            Ok(Some(event)) => {
                counter!(SIGNAL_DECODED_TOTAL, "kind" => event.kind().as_str())
                    .increment(1);
                Some(self.dispatch(event))
            }
            Ok(None) => {
                trace!("Response carried no invalidation signal");
                None
            }
            Err(err) => {
                self.reject_signal(&err);
                None
            }
        }
    }

    /// Patch the store for `event`, then notify matching listeners.
    #[instrument(
        skip(self, event),
        fields(collection = %event.collection(), kind = %event.kind())
    )]
    pub fn dispatch(&self, event: MutationEvent) -> DispatchReport {
        let started = Instant::now();
        let event_id = Uuid::new_v4();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if self.is_disposed() || !self.config.enabled {
            info!(
                event_id = %event_id,
                event_epoch = epoch,
                entity_id = %event.entity_id(),
                disposed = self.is_disposed(),
                "Cache event skipped"
            );
            return DispatchReport {
                event_id,
                epoch,
                patch: PatchOutcome::Skipped,
                delivered: 0,
                failed: Vec::new(),
            };
        }

        let patch = self.patch_phase(&event, event_id);
        let listeners = self.snapshot_phase(event.collection());
        let (delivered, failed) = self.fan_out_phase(&event, event_id, listeners);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(DISPATCH_MS, "kind" => event.kind().as_str()).record(elapsed_ms);

        info!(
            event_id = %event_id,
            event_epoch = epoch,
            entity_id = %event.entity_id(),
            delivered,
            failed = failed.len(),
            elapsed_ms,
            "Cache event dispatched"
        );

        DispatchReport {
            event_id,
            epoch,
            patch,
            delivered,
            failed,
        }
    }

    /// End the session: release every listener and clear the store.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let slots = std::mem::take(&mut *mutex_lock(&self.listeners, SOURCE, "dispose"));
        for slot in &slots {
            slot.active.store(false, Ordering::SeqCst);
        }
        self.store.clear();

        info!(
            released_listeners = slots.len(),
            "Invalidation manager disposed"
        );
    }

    // ========================================================================
    // Phases
    // ========================================================================

    fn patch_phase(&self, event: &MutationEvent, event_id: Uuid) -> PatchOutcome {
        match self.store.apply(event) {
            Ok(report) => {
                debug!(
                    event_id = %event_id,
                    pages_visited = report.pages_visited,
                    pages_changed = report.pages_changed,
                    "Optimistic patch applied"
                );
                PatchOutcome::Applied(report)
            }
            Err(reason) => {
                let invalidated = self.store.invalidate(event.collection());
                counter!(PATCH_FALLBACK_TOTAL).increment(1);
                warn!(
                    event_id = %event_id,
                    error = %reason,
                    invalidated,
                    "Patch could not be reconciled, collection invalidated"
                );
                PatchOutcome::FellBack {
                    reason,
                    invalidated,
                }
            }
        }
    }

    fn snapshot_phase(&self, collection: &Collection) -> Vec<(u64, Arc<AtomicBool>, Callback)> {
        mutex_lock(&self.listeners, SOURCE, "snapshot")
            .iter()
            .filter(|slot| &slot.collection == collection)
            .map(|slot| {
                (
                    slot.id,
                    Arc::clone(&slot.active),
                    Arc::clone(&slot.callback),
                )
            })
            .collect()
    }

    fn fan_out_phase(
        &self,
        event: &MutationEvent,
        event_id: Uuid,
        listeners: Vec<(u64, Arc<AtomicBool>, Callback)>,
    ) -> (usize, Vec<ListenerError>) {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (listener_id, active, callback) in listeners {
            // Re-checked per listener: an earlier callback may have unsubscribed it.
            if !active.load(Ordering::SeqCst) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let failure = ListenerError {
                        listener_id,
                        collection: event.collection().clone(),
                        message: panic_message(payload.as_ref()),
                    };
                    counter!(LISTENER_FAILURE_TOTAL).increment(1);
                    error!(event_id = %event_id, error = %failure, "Listener failed");
                    failed.push(failure);
                }
            }
        }

        (delivered, failed)
    }

    fn reject_signal(&self, err: &SignalDecodeError) {
        counter!(SIGNAL_REJECTED_TOTAL).increment(1);
        warn!(error = %err, "Dropping malformed invalidation signal");
    }

    fn remove_listener(&self, listener_id: u64) {
        mutex_lock(&self.listeners, SOURCE, "unsubscribe").retain(|slot| slot.id != listener_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
