//! Observable per-entity state store with last-writer-wins merges.

use parking_lot::Mutex;
use std::sync::Arc;
use tillsync_protocol::{StateSource, SyncedEntityState};
use tracing::debug;

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Counters describing a store's merge activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Updates accepted and published.
    pub updates_applied: u64,
    /// Stale candidates discarded silently.
    pub stale_discarded: u64,
    /// Individual listener invocations.
    pub notifications_sent: u64,
}

type Listener<P> = Arc<dyn Fn(&SyncedEntityState<P>) + Send + Sync>;

struct StoreInner<P> {
    current: SyncedEntityState<P>,
    listeners: Vec<(SubscriptionId, Listener<P>)>,
    next_subscription: u64,
    stats: StoreStats,
}

/// In-memory container holding the last-known state of one
/// synchronized entity.
///
/// The inner mutex serializes every mutation; listeners are invoked
/// outside it, so a listener may subscribe or unsubscribe reentrantly
/// without deadlocking. External code never mutates the state directly,
/// only through [`EntityStore::apply_update`].
pub struct EntityStore<P> {
    inner: Mutex<StoreInner<P>>,
}

impl<P: Clone> EntityStore<P> {
    /// Creates a store seeded with `initial`.
    pub fn new(initial: SyncedEntityState<P>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                current: initial,
                listeners: Vec::new(),
                next_subscription: 0,
                stats: StoreStats::default(),
            }),
        }
    }

    /// Synchronous read of the current state. Never blocks on I/O,
    /// never fails.
    pub fn current(&self) -> SyncedEntityState<P> {
        self.inner.lock().current.clone()
    }

    /// Registers `listener` to run on every accepted update.
    ///
    /// Listeners run synchronously in registration order with the full
    /// new state.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncedEntityState<P>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Removes a subscription. Unknown ids are a no-op, so calling
    /// this from within a listener callback is safe.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().listeners.retain(|(sid, _)| *sid != id);
    }

    /// Merges `candidate` into the store.
    ///
    /// Accepted only if the candidate supersedes the current state by
    /// the last-writer-wins rule; a stale candidate is discarded
    /// silently (logged, counted, never an error). Returns whether the
    /// candidate was accepted.
    pub fn apply_update(&self, candidate: SyncedEntityState<P>) -> bool {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock();

            if !candidate.supersedes(&inner.current) {
                inner.stats.stale_discarded += 1;
                debug!(
                    entity_id = %inner.current.entity_id,
                    candidate_at = candidate.updated_at,
                    current_at = inner.current.updated_at,
                    "stale update discarded"
                );
                return false;
            }

            inner.current = candidate;
            inner.stats.updates_applied += 1;
            inner.stats.notifications_sent += inner.listeners.len() as u64;

            // Snapshot before notifying; the lock must not be held
            // across listener callbacks.
            let listeners: Vec<Listener<P>> =
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (inner.current.clone(), listeners)
        };

        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    /// Applies a backend-confirmed state, displacing an unconfirmed
    /// optimistic overlay even when the backend stamp is older.
    ///
    /// An optimistic write is stamped by the local clock and may
    /// outrun the backend; authoritative state must still replace it
    /// or a failed mutation would leave it stuck. The store's version
    /// is kept monotonic by lifting the candidate's stamp to the
    /// current one, where the source rank breaks the tie in the
    /// backend's favor.
    pub fn apply_authoritative(&self, mut candidate: SyncedEntityState<P>) -> bool {
        candidate.source = StateSource::Backend;
        {
            let inner = self.inner.lock();
            if inner.current.source == StateSource::Local
                && candidate.updated_at < inner.current.updated_at
            {
                candidate.updated_at = inner.current.updated_at;
            }
        }
        self.apply_update(candidate)
    }

    /// Returns merge counters.
    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}
