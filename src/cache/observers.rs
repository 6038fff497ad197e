//! Collection-scoped observers built on [`InvalidationManager::subscribe`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::domain::entities::Collection;

use super::events::EventKind;
use super::manager::{InvalidationManager, Liveness, Subscription};
use super::query::Refresh;

/// Counts created entities since the view was last focused.
///
/// Dropping the badge unsubscribes it.
pub struct NotificationBadge {
    count: Arc<AtomicUsize>,
    _subscription: Subscription,
}

impl NotificationBadge {
    pub fn attach(manager: &Arc<InvalidationManager>, collection: Collection) -> Self {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let subscription = manager.subscribe(collection, move |event| {
            if event.kind() == EventKind::Created {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        Self {
            count,
            _subscription: subscription,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Clear the badge when the view gains focus, returning the old count.
    pub fn reset(&self) -> usize {
        self.count.swap(0, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct AutoRefreshState {
    pending: AtomicBool,
    scheduled: AtomicUsize,
    coalesced: AtomicUsize,
    completed: AtomicUsize,
    liveness: OnceLock<Liveness>,
}

impl AutoRefreshState {
    fn is_active(&self) -> bool {
        self.liveness.get().is_some_and(Liveness::is_active)
    }
}

/// Refreshes a collection shortly after its events, one refresh per burst.
///
/// The first event schedules a refresh `min_interval` later; events arriving
/// while it is pending fold into it. A refresh that comes due after the
/// observer was detached does nothing.
pub struct AutoRefresh {
    state: Arc<AutoRefreshState>,
    subscription: Subscription,
}

impl AutoRefresh {
    /// Must be called from within a tokio runtime.
    pub fn attach(
        manager: &Arc<InvalidationManager>,
        collection: Collection,
        refresher: Arc<dyn Refresh>,
        min_interval: Duration,
    ) -> Result<Self, TryCurrentError> {
        let runtime = Handle::try_current()?;
        let state = Arc::new(AutoRefreshState::default());

        let callback_state = Arc::clone(&state);
        let target = collection.clone();
        let subscription = manager.subscribe(collection, move |event| {
            if callback_state.pending.swap(true, Ordering::SeqCst) {
                callback_state.coalesced.fetch_add(1, Ordering::SeqCst);
                debug!(
                    collection = %target,
                    entity_id = %event.entity_id(),
                    "Auto-refresh coalesced"
                );
                return;
            }
            callback_state.scheduled.fetch_add(1, Ordering::SeqCst);

            let state = Arc::clone(&callback_state);
            let refresher = Arc::clone(&refresher);
            let collection = target.clone();
            runtime.spawn(async move {
                tokio::time::sleep(min_interval).await;
                state.pending.store(false, Ordering::SeqCst);
                if !state.is_active() {
                    return;
                }

                let summary = refresher.refresh(&collection).await;
                state.completed.fetch_add(1, Ordering::SeqCst);
                debug!(
                    collection = %collection,
                    updated = summary.updated,
                    discarded = summary.discarded,
                    failed = summary.failed,
                    "Auto-refresh finished"
                );
            });
        });

        // Set exactly once, before any scheduled refresh can come due.
        let _ = state.liveness.set(subscription.liveness());

        Ok(Self {
            state,
            subscription,
        })
    }

    /// Refreshes scheduled so far.
    pub fn scheduled(&self) -> usize {
        self.state.scheduled.load(Ordering::SeqCst)
    }

    /// Events folded into an already pending refresh.
    pub fn coalesced(&self) -> usize {
        self.state.coalesced.load(Ordering::SeqCst)
    }

    /// Refreshes that ran to completion.
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

/// Periodically refreshes collections to recover from missed signals.
pub struct PollingSafetyNet {
    task: JoinHandle<()>,
}

impl PollingSafetyNet {
    /// Start polling; the first refresh happens one `period` from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        refresher: Arc<dyn Refresh>,
        collections: Vec<Collection>,
        period: Duration,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // Skip the first immediate tick

            loop {
                interval.tick().await;
                for collection in &collections {
                    let summary = refresher.refresh(collection).await;
                    info!(
                        collection = %collection,
                        updated = summary.updated,
                        discarded = summary.discarded,
                        failed = summary.failed,
                        "Polling refresh completed"
                    );
                }
            }
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PollingSafetyNet {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Log every event of a collection as it is dispatched.
pub fn log_events(manager: &Arc<InvalidationManager>, collection: Collection) -> Subscription {
    manager.subscribe(collection, |event| {
        info!(
            collection = %event.collection(),
            kind = %event.kind(),
            entity_id = %event.entity_id(),
            "Collection changed"
        );
    })
}
