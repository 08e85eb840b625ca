//! Integration tests: stores, reconcilers, and safe operations wired
//! against an in-memory backend.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{
    create_cash_session_store, create_loyalty_store, Broadcaster, LocalBroadcaster, LockManager,
    MockBackend, MutationBackend, MutationGateway, NoopBroadcaster, RetryConfig, SafeOperations,
    SyncConfig, SyncError, SyncResult,
};
use tillsync_protocol::{
    IdempotencyKey, MutationRequest, Origin, Outcome, SessionStatus,
};

const POLL: Duration = Duration::from_millis(25);

fn config(device: &str) -> SyncConfig {
    SyncConfig::new(Origin::new(device, format!("term-{device}"))).with_poll_interval(POLL)
}

fn safe_ops(backend: Arc<MockBackend>, locks: Arc<LockManager>, config: SyncConfig) -> SafeOperations {
    let gateway = MutationGateway::new(
        backend,
        config.gateway_timeout,
        config.gateway_retry.clone(),
    );
    SafeOperations::new(locks, gateway, config)
}

/// Delegates to a mock backend after a fixed delay, so lock contention
/// windows are wide enough to exercise deterministically.
struct SlowBackend {
    inner: Arc<MockBackend>,
    delay: Duration,
}

#[async_trait]
impl MutationBackend for SlowBackend {
    async fn mutate(&self, request: &MutationRequest) -> SyncResult<Outcome> {
        tokio::time::sleep(self.delay).await;
        self.inner.mutate(request).await
    }
}

#[tokio::test]
async fn two_tabs_converge_after_optimistic_close() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_session("s-1", 10_000);
    let bus: Arc<dyn Broadcaster> = Arc::new(LocalBroadcaster::new());

    let tab_a = create_cash_session_store(
        "s-1",
        Arc::clone(&backend),
        Arc::clone(&bus),
        Arc::new(LockManager::new()),
        config("a"),
    );
    let tab_b = create_cash_session_store(
        "s-1",
        Arc::clone(&backend),
        Arc::clone(&bus),
        Arc::new(LockManager::new()),
        // Slow poller: only the broadcast can deliver this in time.
        config("b").with_poll_interval(Duration::from_secs(600)),
    );
    tab_a.start().await.unwrap();
    tab_b.start().await.unwrap();

    tab_a.close_session(1500, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let a = tab_a.store().current();
    let b = tab_b.store().current();
    assert_eq!(a.payload.status, SessionStatus::Closed);
    assert_eq!(a.payload, b.payload);
    assert_eq!(a.updated_at, b.updated_at);

    tab_a.stop();
    tab_b.stop();
}

#[tokio::test]
async fn partitioned_devices_converge_by_polling() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_session("s-1", 10_000);

    // Separate devices: no shared broadcast transport at all.
    let device_a = create_cash_session_store(
        "s-1",
        Arc::clone(&backend),
        Arc::new(NoopBroadcaster::new()),
        Arc::new(LockManager::new()),
        config("a"),
    );
    let device_b = create_cash_session_store(
        "s-1",
        Arc::clone(&backend),
        Arc::new(NoopBroadcaster::new()),
        Arc::new(LockManager::new()),
        config("b"),
    );
    device_a.start().await.unwrap();
    device_b.start().await.unwrap();

    device_a.close_session(1500, None).await.unwrap();

    // Within one polling interval after the backend quiesces, both
    // report identical state.
    tokio::time::sleep(POLL * 3).await;

    let a = device_a.store().current();
    let b = device_b.store().current();
    assert_eq!(a.payload.status, SessionStatus::Closed);
    assert_eq!(b.payload.status, SessionStatus::Closed);
    assert_eq!(a.payload.closing_amount, Some(1500));
    assert_eq!(a.payload, b.payload);

    device_a.stop();
    device_b.stop();
}

#[tokio::test]
async fn same_key_adjustments_apply_once() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_balance("c-1", 0);
    let locks = Arc::new(LockManager::new());
    let ops = safe_ops(Arc::clone(&backend), locks, config("a"));

    let key = IdempotencyKey::new("adjust-c1-receipt-77").unwrap();
    let first = ops
        .adjust_points_safe("c-1", 10, None, Some(key.clone()))
        .await
        .unwrap();
    let second = ops
        .adjust_points_safe("c-1", 10, None, Some(key))
        .await
        .unwrap();

    assert_eq!(first.data, second.data);
    assert!(second.replayed);
    assert_eq!(backend.balance("c-1").unwrap().payload.current_points, 10);
    assert_eq!(backend.effects(), 1);
}

#[tokio::test]
async fn distinct_key_adjustments_apply_twice() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_balance("c-1", 0);
    let locks = Arc::new(LockManager::new());
    let ops = safe_ops(Arc::clone(&backend), locks, config("a"));

    ops.adjust_points_safe("c-1", 10, None, None).await.unwrap();
    ops.adjust_points_safe("c-1", 10, None, None).await.unwrap();

    assert_eq!(backend.balance("c-1").unwrap().payload.current_points, 20);
    assert_eq!(backend.effects(), 2);
}

#[tokio::test]
async fn concurrent_redeems_never_double_redeem() {
    let inner = Arc::new(MockBackend::new());
    inner.seed_balance("c-1", 100);
    let slow = Arc::new(SlowBackend {
        inner: Arc::clone(&inner),
        delay: Duration::from_millis(40),
    });

    let locks = Arc::new(LockManager::new());
    let cfg = config("a");
    let gateway = MutationGateway::new(slow, cfg.gateway_timeout, RetryConfig::no_retry());
    let ops = Arc::new(SafeOperations::new(locks, gateway, cfg));

    let (first, second) = tokio::join!(
        ops.redeem_reward_safe("r-1", "c-1", None, None),
        ops.redeem_reward_safe("r-1", "c-1", None, None),
    );

    let failures = [&first, &second]
        .iter()
        .filter(|r| r.is_err())
        .count();
    assert_eq!(failures, 1, "exactly one redeem must fail");

    let err = first.and(second).unwrap_err();
    assert!(
        matches!(
            err,
            SyncError::ResourceBusy { .. } | SyncError::RemoteRejected(_)
        ),
        "unexpected error: {err}"
    );
    assert_eq!(inner.effects(), 1);
}

#[tokio::test]
async fn outage_during_close_recovers_by_reconciliation() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_session("s-1", 10_000);

    let handle = create_cash_session_store(
        "s-1",
        Arc::clone(&backend),
        Arc::new(NoopBroadcaster::new()),
        Arc::new(LockManager::new()),
        config("a"),
    );
    handle.start().await.unwrap();

    backend.set_unavailable(true);
    let err = handle.close_session(1500, None).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(backend.effects(), 0);

    // The optimistic close could not be rolled back while the backend
    // was down; the polling path repairs it once service returns.
    backend.set_unavailable(false);
    tokio::time::sleep(POLL * 3).await;

    assert_eq!(
        handle.store().current().payload.status,
        SessionStatus::Open,
        "optimistic state must not be left stuck"
    );
    handle.stop();
}

#[tokio::test]
async fn retrying_after_outage_with_same_key_is_safe() {
    let backend = Arc::new(MockBackend::new());
    backend.seed_session("s-1", 10_000);
    let locks = Arc::new(LockManager::new());
    let ops = safe_ops(Arc::clone(&backend), locks, config("a"));

    let key = IdempotencyKey::new("close-s1-shift-end").unwrap();

    backend.set_unavailable(true);
    let err = ops
        .close_cash_session_safe("s-1", 1500, Some(key.clone()))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    backend.set_unavailable(false);
    let outcome = ops
        .close_cash_session_safe("s-1", 1500, Some(key))
        .await
        .unwrap();

    assert!(!outcome.replayed);
    assert_eq!(backend.effects(), 1);
    assert_eq!(
        backend.session("s-1").unwrap().payload.closing_amount,
        Some(1500)
    );
}
