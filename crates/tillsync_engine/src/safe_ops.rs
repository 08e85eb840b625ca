//! Exactly-once mutation façade over the lock manager and gateway.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::MutationGateway;
use crate::lock::{LockManager, SweeperHandle};
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{IdempotencyKey, MutationOp, Outcome};
use tracing::debug;

/// Composes the lock manager and mutation gateway into operations with
/// exactly-once semantics.
///
/// Every operation follows one template: derive an entity-scoped
/// resource key, acquire its lock (failing with `ResourceBusy` rather
/// than proceeding without it), issue the gateway call with an
/// idempotency key,
/// and release the lock on every exit path. The lock stops redundant
/// in-process races; the key stops double effects across processes.
pub struct SafeOperations {
    locks: Arc<LockManager>,
    gateway: MutationGateway,
    config: SyncConfig,
    _sweeper: SweeperHandle,
}

impl SafeOperations {
    /// Creates the façade.
    ///
    /// Spawns the lock table's periodic expiry sweep at
    /// `config.sweep_interval`; the sweep stops when the façade is
    /// dropped. Must be called from within a tokio runtime.
    pub fn new(locks: Arc<LockManager>, gateway: MutationGateway, config: SyncConfig) -> Self {
        let sweeper = locks.spawn_sweeper(config.sweep_interval);
        Self {
            locks,
            gateway,
            config,
            _sweeper: sweeper,
        }
    }

    /// Closes a cash session with the counted drawer amount.
    pub async fn close_cash_session_safe(
        &self,
        session_id: &str,
        counted_cash: i64,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        self.run(
            format!("cash:{session_id}"),
            self.config.close_ttl,
            MutationOp::CloseCashSession {
                session_id: session_id.to_string(),
                counted_cash,
            },
            key,
        )
        .await
    }

    /// Adjusts a customer's loyalty point balance.
    pub async fn adjust_points_safe(
        &self,
        customer_id: &str,
        delta: i64,
        description: Option<String>,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        self.run(
            format!("points:{customer_id}"),
            self.config.adjust_ttl,
            MutationOp::AdjustPoints {
                customer_id: customer_id.to_string(),
                delta,
                description,
            },
            key,
        )
        .await
    }

    /// Redeems a loyalty reward for a customer.
    pub async fn redeem_reward_safe(
        &self,
        reward_id: &str,
        customer_id: &str,
        sale_id: Option<String>,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        self.run(
            format!("reward:{reward_id}"),
            self.config.redeem_ttl,
            MutationOp::RedeemReward {
                reward_id: reward_id.to_string(),
                customer_id: customer_id.to_string(),
                sale_id,
            },
            key,
        )
        .await
    }

    /// Lock-then-mutate template shared by every safe operation.
    ///
    /// `ResourceBusy` is retried per the configured policy (off by
    /// default), reusing the same idempotency key across rounds since
    /// the intent is one operation.
    async fn run(
        &self,
        resource: String,
        ttl: Duration,
        op: MutationOp,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        let key = key.unwrap_or_else(IdempotencyKey::generate);
        let policy = &self.config.busy_retry;
        let mut last_busy = None;

        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                let delay = policy.delay_for_attempt(attempt);
                debug!(%resource, attempt, ?delay, "resource busy, retrying acquire");
                tokio::time::sleep(delay).await;
            }

            match self.locks.guard(&resource, ttl) {
                Ok(_guard) => {
                    // Guard drops on every path out of this call.
                    return self.gateway.execute(op, Some(key)).await;
                }
                Err(e @ SyncError::ResourceBusy { .. }) => last_busy = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_busy.unwrap_or_else(|| SyncError::busy(resource)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::RetryConfig;
    use tillsync_protocol::Origin;

    fn ops(backend: Arc<MockBackend>, locks: Arc<LockManager>, config: SyncConfig) -> SafeOperations {
        let gateway = MutationGateway::new(
            backend,
            config.gateway_timeout,
            config.gateway_retry.clone(),
        );
        SafeOperations::new(locks, gateway, config)
    }

    fn config() -> SyncConfig {
        SyncConfig::new(Origin::new("dev-1", "term-1"))
    }

    #[tokio::test]
    async fn close_session_acquires_and_releases() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_session("s-1", 100);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend.clone(), Arc::clone(&locks), config());

        let outcome = ops
            .close_cash_session_safe("s-1", 1500, None)
            .await
            .unwrap();
        assert_eq!(outcome.entity_id, "s-1");
        assert!(!locks.is_locked("cash:s-1"));
        assert_eq!(backend.effects(), 1);
    }

    #[tokio::test]
    async fn held_lock_fails_fast_with_busy() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_session("s-1", 100);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend.clone(), Arc::clone(&locks), config());

        let _held = locks.guard("cash:s-1", Duration::from_secs(30)).unwrap();

        let err = ops
            .close_cash_session_safe("s-1", 1500, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ResourceBusy { .. }));
        // Never proceeded without the lock.
        assert_eq!(backend.mutate_calls(), 0);
    }

    #[tokio::test]
    async fn lock_released_after_remote_rejection() {
        let backend = Arc::new(MockBackend::new());
        // No session seeded: the backend rejects the close.
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend, Arc::clone(&locks), config());

        let err = ops
            .close_cash_session_safe("s-1", 1500, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteRejected(_)));
        assert!(!locks.is_locked("cash:s-1"));
    }

    #[tokio::test]
    async fn lock_released_when_backend_unavailable() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_session("s-1", 100);
        backend.set_unavailable(true);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend, Arc::clone(&locks), config());

        let err = ops
            .close_cash_session_safe("s-1", 1500, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!locks.is_locked("cash:s-1"));
    }

    #[tokio::test]
    async fn same_key_twice_yields_equal_outcomes_one_effect() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_balance("c-1", 0);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend.clone(), locks, config());

        let key = IdempotencyKey::new("adjust-c1-10").unwrap();
        let first = ops
            .adjust_points_safe("c-1", 10, None, Some(key.clone()))
            .await
            .unwrap();
        let second = ops
            .adjust_points_safe("c-1", 10, None, Some(key))
            .await
            .unwrap();

        assert_eq!(backend.effects(), 1);
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(first.data, second.data);
        assert!(second.replayed);
        assert_eq!(backend.balance("c-1").unwrap().payload.current_points, 10);
    }

    #[tokio::test]
    async fn distinct_keys_apply_twice() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_balance("c-1", 0);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend.clone(), locks, config());

        ops.adjust_points_safe("c-1", 10, None, None).await.unwrap();
        ops.adjust_points_safe("c-1", 10, None, None).await.unwrap();

        assert_eq!(backend.effects(), 2);
        assert_eq!(backend.balance("c-1").unwrap().payload.current_points, 20);
    }

    #[tokio::test]
    async fn second_redeem_sees_rejection() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_balance("c-1", 100);
        let locks = Arc::new(LockManager::new());
        let ops = ops(backend.clone(), locks, config());

        ops.redeem_reward_safe("r-1", "c-1", None, None)
            .await
            .unwrap();
        let err = ops
            .redeem_reward_safe("r-1", "c-1", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RemoteRejected(_)));
        assert_eq!(backend.effects(), 1);
    }

    #[tokio::test]
    async fn facade_sweeps_expired_locks() {
        let backend = Arc::new(MockBackend::new());
        let locks = Arc::new(LockManager::new());
        let config = config().with_sweep_interval(Duration::from_millis(10));
        let _ops = ops(backend, Arc::clone(&locks), config);

        // An abandoned short-TTL entry, never released.
        assert!(locks.acquire("cash:stale", Duration::from_millis(5)));
        assert_eq!(locks.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn busy_retry_policy_waits_for_release() {
        let backend = Arc::new(MockBackend::new());
        backend.seed_balance("c-1", 0);
        let locks = Arc::new(LockManager::new());
        let config = config().with_busy_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(10))
                .without_jitter(),
        );
        let ops = ops(backend.clone(), Arc::clone(&locks), config);

        let held = locks.guard("points:c-1", Duration::from_secs(30)).unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            drop(held);
        });

        let outcome = ops.adjust_points_safe("c-1", 10, None, None).await.unwrap();
        assert!(!outcome.replayed);
        release.await.unwrap();
    }
}
