//! Idempotent mutation requests and their outcomes.

use crate::envelope::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error building an idempotency key.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    /// The supplied key was empty.
    #[error("idempotency key must not be empty")]
    Empty,
}

/// Caller-supplied token ensuring a remote mutation's effect happens at
/// most once even if the request is retried or duplicated.
///
/// Keys are mandatory on the wire: a mutation never reaches the backend
/// without one. Callers that have no natural key generate a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wraps a caller-supplied key. Empty keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(key))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named state-changing remote procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    /// Close a cash-register session with the counted drawer amount.
    CloseCashSession {
        /// Session being closed.
        session_id: String,
        /// Cash counted at close, in minor units.
        counted_cash: i64,
    },
    /// Adjust a customer's loyalty point balance.
    AdjustPoints {
        /// Customer whose balance changes.
        customer_id: String,
        /// Signed point delta.
        delta: i64,
        /// Human-readable reason.
        description: Option<String>,
    },
    /// Redeem a loyalty reward.
    RedeemReward {
        /// Reward being redeemed.
        reward_id: String,
        /// Redeeming customer.
        customer_id: String,
        /// Sale the redemption applies to, if any.
        sale_id: Option<String>,
    },
}

impl MutationOp {
    /// Returns the remote procedure name.
    pub fn name(&self) -> &'static str {
        match self {
            MutationOp::CloseCashSession { .. } => "close_cash_session",
            MutationOp::AdjustPoints { .. } => "adjust_points",
            MutationOp::RedeemReward { .. } => "redeem_reward",
        }
    }

    /// Returns the id of the entity this operation mutates.
    pub fn entity_id(&self) -> &str {
        match self {
            MutationOp::CloseCashSession { session_id, .. } => session_id,
            MutationOp::AdjustPoints { customer_id, .. } => customer_id,
            MutationOp::RedeemReward { customer_id, .. } => customer_id,
        }
    }
}

/// A mutation ready to be issued to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// The operation to perform.
    #[serde(flatten)]
    pub op: MutationOp,
    /// At-most-once token.
    pub idempotency_key: IdempotencyKey,
}

impl MutationRequest {
    /// Creates a request for `op` under `key`.
    pub fn new(op: MutationOp, key: IdempotencyKey) -> Self {
        Self {
            op,
            idempotency_key: key,
        }
    }
}

/// Result of a durable remote mutation.
///
/// When the backend sees a duplicate idempotency key it returns the
/// prior result with `replayed` set instead of applying a second
/// effect; callers treat that as success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Entity the mutation affected.
    pub entity_id: String,
    /// Server-stamped version of the resulting state.
    pub updated_at: Timestamp,
    /// True if this is a prior result replayed for a duplicate key.
    #[serde(default)]
    pub replayed: bool,
    /// Operation-specific result fields.
    pub data: serde_json::Value,
}
