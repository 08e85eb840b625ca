//! Application-facing store surfaces for cash sessions and loyalty
//! balances.

use crate::backend::{AuthoritativeSource, MutationBackend};
use crate::broadcast::{BroadcastFrame, Broadcaster};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::gateway::MutationGateway;
use crate::lock::LockManager;
use crate::reconciler::Reconciler;
use crate::safe_ops::SafeOperations;
use crate::store::EntityStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tillsync_protocol::{
    now_millis, CashSessionPayload, IdempotencyKey, LoyaltyPayload, Origin, Outcome, StateSource,
    SyncedEntityState,
};
use tracing::warn;

/// Shared plumbing behind both handle types.
struct EntityHandle<P> {
    store: Arc<EntityStore<P>>,
    reconciler: Reconciler<P>,
    source: Arc<dyn AuthoritativeSource<P>>,
    broadcaster: Arc<dyn Broadcaster>,
    channel: String,
    origin: Origin,
}

impl<P> EntityHandle<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(
        entity_id: &str,
        initial_payload: P,
        channel: String,
        source: Arc<dyn AuthoritativeSource<P>>,
        broadcaster: Arc<dyn Broadcaster>,
        config: SyncConfig,
    ) -> Self {
        // Sentinel version: the first authoritative fetch always wins.
        let store = Arc::new(EntityStore::new(SyncedEntityState::new(
            entity_id,
            initial_payload,
            -1,
            config.origin.clone(),
            StateSource::Local,
        )));
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&source),
            Arc::clone(&broadcaster),
            channel.clone(),
            config.clone(),
        );
        Self {
            store,
            reconciler,
            source,
            broadcaster,
            channel,
            origin: config.origin,
        }
    }

    /// Optimistically applies a locally-stamped payload so the UI
    /// updates before the remote call resolves.
    fn apply_optimistic(&self, payload: P) {
        let current = self.store.current();
        self.store.apply_update(SyncedEntityState::new(
            current.entity_id,
            payload,
            now_millis().max(current.updated_at + 1),
            self.origin.clone(),
            StateSource::Local,
        ));
    }

    /// Applies a confirmed outcome: the backend-stamped state wins any
    /// merge against the optimistic write, and peers are notified.
    fn apply_confirmed(&self, outcome: &Outcome) -> SyncResult<()> {
        let payload: P = serde_json::from_value(outcome.data.clone())?;
        let state = SyncedEntityState::new(
            outcome.entity_id.clone(),
            payload,
            outcome.updated_at,
            self.origin.clone(),
            StateSource::Backend,
        );
        if self.store.apply_authoritative(state) {
            match self.store.current().erase() {
                Ok(erased) => self
                    .broadcaster
                    .publish(BroadcastFrame::new(self.channel.clone(), erased)),
                Err(e) => warn!(channel = %self.channel, error = %e, "failed to encode frame"),
            }
        }
        Ok(())
    }

    /// Rolls an optimistic write back to the authoritative state after
    /// a rejected or failed mutation.
    async fn rollback(&self) {
        let entity_id = self.store.current().entity_id;
        match self.source.fetch(&entity_id).await {
            Ok(state) => {
                self.store.apply_authoritative(state);
            }
            Err(e) => {
                // The next reconciliation poll resolves the true state.
                warn!(channel = %self.channel, error = %e, "rollback fetch failed");
            }
        }
    }
}

/// Synchronized view of one cash-register session with a safe close
/// action.
pub struct CashSessionHandle {
    inner: EntityHandle<CashSessionPayload>,
    safe: Arc<SafeOperations>,
    session_id: String,
}

impl CashSessionHandle {
    /// The observable store for this session.
    pub fn store(&self) -> &Arc<EntityStore<CashSessionPayload>> {
        &self.inner.store
    }

    /// Starts reconciliation: immediate fetch, then polling and peer
    /// merges.
    pub async fn start(&self) -> SyncResult<()> {
        self.inner.reconciler.start().await
    }

    /// Stops reconciliation. Idempotent.
    pub fn stop(&self) {
        self.inner.reconciler.stop();
    }

    /// Closes the session with the counted drawer amount.
    ///
    /// Writes an optimistic closed state first so the register UI does
    /// not wait on the network, then reconciles with the backend's
    /// answer: the confirmed state replaces the optimistic one, and any
    /// rejection or outage rolls back to authoritative state.
    pub async fn close_session(
        &self,
        counted_cash: i64,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        let optimistic = self.inner.store.current().payload.closed(counted_cash);
        self.inner.apply_optimistic(optimistic);

        match self
            .safe
            .close_cash_session_safe(&self.session_id, counted_cash, key)
            .await
        {
            Ok(outcome) => {
                self.inner.apply_confirmed(&outcome)?;
                Ok(outcome)
            }
            Err(e) => {
                self.inner.rollback().await;
                Err(e)
            }
        }
    }
}

/// Synchronized view of one customer's loyalty balance with a safe
/// adjustment action.
pub struct LoyaltyHandle {
    inner: EntityHandle<LoyaltyPayload>,
    safe: Arc<SafeOperations>,
    customer_id: String,
}

impl LoyaltyHandle {
    /// The observable store for this balance.
    pub fn store(&self) -> &Arc<EntityStore<LoyaltyPayload>> {
        &self.inner.store
    }

    /// Starts reconciliation.
    pub async fn start(&self) -> SyncResult<()> {
        self.inner.reconciler.start().await
    }

    /// Stops reconciliation. Idempotent.
    pub fn stop(&self) {
        self.inner.reconciler.stop();
    }

    /// Adjusts the balance by `delta` points, optimistically first.
    pub async fn adjust_points(
        &self,
        delta: i64,
        description: Option<String>,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        let optimistic = self
            .inner
            .store
            .current()
            .payload
            .adjusted(delta, now_millis());
        self.inner.apply_optimistic(optimistic);

        match self
            .safe
            .adjust_points_safe(&self.customer_id, delta, description, key)
            .await
        {
            Ok(outcome) => {
                self.inner.apply_confirmed(&outcome)?;
                Ok(outcome)
            }
            Err(e) => {
                self.inner.rollback().await;
                Err(e)
            }
        }
    }
}

/// Wires a cash-session store, reconciler, and safe-close action for
/// one session.
pub fn create_cash_session_store<B>(
    session_id: &str,
    backend: Arc<B>,
    broadcaster: Arc<dyn Broadcaster>,
    locks: Arc<LockManager>,
    config: SyncConfig,
) -> CashSessionHandle
where
    B: AuthoritativeSource<CashSessionPayload> + MutationBackend + 'static,
{
    let gateway = MutationGateway::new(
        Arc::clone(&backend) as Arc<dyn MutationBackend>,
        config.gateway_timeout,
        config.gateway_retry.clone(),
    );
    let safe = Arc::new(SafeOperations::new(locks, gateway, config.clone()));
    let inner = EntityHandle::new(
        session_id,
        CashSessionPayload::open(0),
        format!("cash:{session_id}"),
        backend as Arc<dyn AuthoritativeSource<CashSessionPayload>>,
        broadcaster,
        config,
    );
    CashSessionHandle {
        inner,
        safe,
        session_id: session_id.to_string(),
    }
}

/// Wires a loyalty store, reconciler, and safe adjustment action for
/// one customer.
pub fn create_loyalty_store<B>(
    customer_id: &str,
    backend: Arc<B>,
    broadcaster: Arc<dyn Broadcaster>,
    locks: Arc<LockManager>,
    config: SyncConfig,
) -> LoyaltyHandle
where
    B: AuthoritativeSource<LoyaltyPayload> + MutationBackend + 'static,
{
    let gateway = MutationGateway::new(
        Arc::clone(&backend) as Arc<dyn MutationBackend>,
        config.gateway_timeout,
        config.gateway_retry.clone(),
    );
    let safe = Arc::new(SafeOperations::new(locks, gateway, config.clone()));
    let inner = EntityHandle::new(
        customer_id,
        LoyaltyPayload::new(),
        format!("loyalty:{customer_id}"),
        backend as Arc<dyn AuthoritativeSource<LoyaltyPayload>>,
        broadcaster,
        config,
    );
    LoyaltyHandle {
        inner,
        safe,
        customer_id: customer_id.to_string(),
    }
}
