//! Backend collaborator seams and an in-memory mock.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tillsync_protocol::{
    now_millis, CashSessionPayload, IdempotencyKey, LoyaltyPayload, MutationOp, MutationRequest,
    Origin, Outcome, StateSource, SyncedEntityState, Timestamp,
};

/// Authoritative read side of the backend for one payload type.
///
/// Implementations must return a server-stamped `updated_at`.
#[async_trait]
pub trait AuthoritativeSource<P>: Send + Sync {
    /// Fetches the current authoritative state of `entity_id`.
    async fn fetch(&self, entity_id: &str) -> SyncResult<SyncedEntityState<P>>;
}

/// Durable mutation side of the backend.
///
/// Two calls with the same idempotency key must produce one effect and
/// return the same [`Outcome`] to both callers (the second marked
/// `replayed`).
#[async_trait]
pub trait MutationBackend: Send + Sync {
    /// Executes a named remote mutation.
    async fn mutate(&self, request: &MutationRequest) -> SyncResult<Outcome>;
}

/// In-memory backend for tests and local development.
///
/// Holds cash-session and loyalty tables, an idempotency-record map,
/// and switches to script unavailability. Implements both
/// [`AuthoritativeSource`] payloads and [`MutationBackend`].
#[derive(Debug, Default)]
pub struct MockBackend {
    sessions: Mutex<HashMap<String, SyncedEntityState<CashSessionPayload>>>,
    balances: Mutex<HashMap<String, SyncedEntityState<LoyaltyPayload>>>,
    redeemed_rewards: Mutex<HashMap<String, String>>,
    idempotency: Mutex<HashMap<IdempotencyKey, Outcome>>,
    unavailable: AtomicBool,
    last_stamp: AtomicU64,
    mutate_calls: AtomicU64,
    effects: AtomicU64,
}

impl MockBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an open cash session.
    pub fn seed_session(&self, session_id: &str, opening_amount: i64) {
        let stamp = self.stamp();
        self.sessions.lock().insert(
            session_id.to_string(),
            SyncedEntityState::new(
                session_id,
                CashSessionPayload::open(opening_amount),
                stamp,
                Self::origin(),
                StateSource::Backend,
            ),
        );
    }

    /// Seeds a loyalty balance.
    pub fn seed_balance(&self, customer_id: &str, points: i64) {
        let stamp = self.stamp();
        let payload = LoyaltyPayload {
            current_points: points,
            total_redeemed: 0,
            last_activity: stamp,
        };
        self.balances.lock().insert(
            customer_id.to_string(),
            SyncedEntityState::new(
                customer_id,
                payload,
                stamp,
                Self::origin(),
                StateSource::Backend,
            ),
        );
    }

    /// Scripts network unavailability for subsequent calls.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `mutate` calls received, replays included.
    pub fn mutate_calls(&self) -> u64 {
        self.mutate_calls.load(Ordering::SeqCst)
    }

    /// Number of mutations that actually changed state.
    pub fn effects(&self) -> u64 {
        self.effects.load(Ordering::SeqCst)
    }

    /// Current session state, if seeded.
    pub fn session(&self, session_id: &str) -> Option<SyncedEntityState<CashSessionPayload>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Current balance state, if seeded.
    pub fn balance(&self, customer_id: &str) -> Option<SyncedEntityState<LoyaltyPayload>> {
        self.balances.lock().get(customer_id).cloned()
    }

    fn origin() -> Origin {
        Origin::new("backend", "backend")
    }

    /// Server stamp, strictly increasing across calls.
    fn stamp(&self) -> Timestamp {
        let now = now_millis() as u64;
        let mut prev = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next as Timestamp,
                Err(observed) => prev = observed,
            }
        }
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::unavailable("backend unreachable"));
        }
        Ok(())
    }

    fn apply(&self, op: &MutationOp) -> SyncResult<Outcome> {
        match op {
            MutationOp::CloseCashSession {
                session_id,
                counted_cash,
            } => {
                let mut sessions = self.sessions.lock();
                let state = sessions
                    .get_mut(session_id)
                    .ok_or_else(|| SyncError::RemoteRejected(format!(
                        "unknown session: {session_id}"
                    )))?;
                if state.payload.closing_amount.is_some() {
                    return Err(SyncError::RemoteRejected("session already closed".into()));
                }
                state.payload = state.payload.closed(*counted_cash);
                state.updated_at = self.stamp();
                Ok(Outcome {
                    entity_id: session_id.clone(),
                    updated_at: state.updated_at,
                    replayed: false,
                    data: serde_json::to_value(&state.payload)?,
                })
            }
            MutationOp::AdjustPoints {
                customer_id, delta, ..
            } => {
                let mut balances = self.balances.lock();
                let state = balances
                    .get_mut(customer_id)
                    .ok_or_else(|| SyncError::RemoteRejected(format!(
                        "unknown customer: {customer_id}"
                    )))?;
                if *delta < 0 && state.payload.current_points + delta < 0 {
                    return Err(SyncError::RemoteRejected("insufficient points".into()));
                }
                let stamp = self.stamp();
                state.payload = state.payload.adjusted(*delta, stamp);
                state.updated_at = stamp;
                Ok(Outcome {
                    entity_id: customer_id.clone(),
                    updated_at: stamp,
                    replayed: false,
                    data: serde_json::to_value(&state.payload)?,
                })
            }
            MutationOp::RedeemReward {
                reward_id,
                customer_id,
                ..
            } => {
                let mut redeemed = self.redeemed_rewards.lock();
                if redeemed.contains_key(reward_id) {
                    return Err(SyncError::RemoteRejected("reward already redeemed".into()));
                }
                redeemed.insert(reward_id.clone(), customer_id.clone());
                let stamp = self.stamp();
                Ok(Outcome {
                    entity_id: customer_id.clone(),
                    updated_at: stamp,
                    replayed: false,
                    data: serde_json::json!({ "reward_id": reward_id, "redeemed": true }),
                })
            }
        }
    }
}

#[async_trait]
impl AuthoritativeSource<CashSessionPayload> for MockBackend {
    async fn fetch(&self, entity_id: &str) -> SyncResult<SyncedEntityState<CashSessionPayload>> {
        self.check_available()?;
        self.sessions
            .lock()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| SyncError::RemoteRejected(format!("unknown session: {entity_id}")))
    }
}

#[async_trait]
impl AuthoritativeSource<LoyaltyPayload> for MockBackend {
    async fn fetch(&self, entity_id: &str) -> SyncResult<SyncedEntityState<LoyaltyPayload>> {
        self.check_available()?;
        self.balances
            .lock()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| SyncError::RemoteRejected(format!("unknown customer: {entity_id}")))
    }
}

#[async_trait]
impl MutationBackend for MockBackend {
    async fn mutate(&self, request: &MutationRequest) -> SyncResult<Outcome> {
        self.mutate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        // Duplicate key: replay the prior result, no second effect.
        if let Some(prior) = self.idempotency.lock().get(&request.idempotency_key) {
            let mut replay = prior.clone();
            replay.replayed = true;
            return Ok(replay);
        }

        let outcome = self.apply(&request.op)?;
        self.effects.fetch_add(1, Ordering::SeqCst);
        self.idempotency
            .lock()
            .insert(request.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }
}
