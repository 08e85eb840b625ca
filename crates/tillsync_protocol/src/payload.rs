//! Domain payloads carried by the synchronized-state envelope.

use crate::envelope::Timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a cash-register session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is open and accepting sales.
    Open,
    /// Session has been counted and closed.
    Closed,
}

/// Synchronized fields of a cash-register session.
///
/// Amounts are in minor currency units (cents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashSessionPayload {
    /// Open or closed.
    pub status: SessionStatus,
    /// Float counted into the drawer at open.
    pub opening_amount: i64,
    /// Cash counted at close; `None` while the session is open.
    pub closing_amount: Option<i64>,
    /// Free-form closing notes.
    pub notes: Option<String>,
}

impl CashSessionPayload {
    /// Creates a payload for a freshly opened session.
    pub fn open(opening_amount: i64) -> Self {
        Self {
            status: SessionStatus::Open,
            opening_amount,
            closing_amount: None,
            notes: None,
        }
    }

    /// Returns a closed copy of this payload with the counted amount.
    pub fn closed(&self, closing_amount: i64) -> Self {
        Self {
            status: SessionStatus::Closed,
            opening_amount: self.opening_amount,
            closing_amount: Some(closing_amount),
            notes: self.notes.clone(),
        }
    }
}

/// Synchronized fields of a customer's loyalty balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyPayload {
    /// Current redeemable points.
    pub current_points: i64,
    /// Lifetime points redeemed.
    pub total_redeemed: i64,
    /// When the balance last changed.
    pub last_activity: Timestamp,
}

impl LoyaltyPayload {
    /// Creates a zeroed balance.
    pub fn new() -> Self {
        Self {
            current_points: 0,
            total_redeemed: 0,
            last_activity: 0,
        }
    }

    /// Returns a copy with `delta` applied at `at`.
    pub fn adjusted(&self, delta: i64, at: Timestamp) -> Self {
        Self {
            current_points: self.current_points + delta,
            total_redeemed: if delta < 0 {
                self.total_redeemed - delta
            } else {
                self.total_redeemed
            },
            last_activity: at,
        }
    }
}

impl Default for LoyaltyPayload {
    fn default() -> Self {
        Self::new()
    }
}
