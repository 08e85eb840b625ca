//! The synchronized-state envelope and its merge rule.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Returns the current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Identifies the client context that produced a state version.
///
/// Used for diagnostics and to avoid re-applying a broadcast frame to
/// its own producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Device (browser context, terminal host) identifier.
    pub device_id: String,
    /// Point-of-sale terminal identifier.
    pub terminal_id: String,
}

impl Origin {
    /// Creates a new origin.
    pub fn new(device_id: impl Into<String>, terminal_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            terminal_id: terminal_id.into(),
        }
    }
}

/// Where a state version came from.
///
/// Used as the tie-breaker when two versions carry the same `updated_at`:
/// a backend-stamped version beats a peer broadcast, which beats a local
/// optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    /// Server-stamped, authoritative.
    Backend,
    /// Received from another client context over broadcast.
    Peer,
    /// Locally-stamped optimistic write, not yet confirmed.
    Local,
}

impl StateSource {
    /// Tie-break rank; higher wins on equal timestamps.
    fn rank(self) -> u8 {
        match self {
            StateSource::Backend => 2,
            StateSource::Peer => 1,
            StateSource::Local => 0,
        }
    }
}

/// Generic envelope wrapping one synchronized domain object.
///
/// # Invariants
///
/// - `entity_id` is immutable after creation
/// - `updated_at` is monotonically non-decreasing within one store;
///   a merge never regresses it
/// - Versions for the same entity are ordered by `updated_at`; ties go
///   to the higher-ranked [`StateSource`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedEntityState<P> {
    /// Stable identifier (session id or customer id).
    pub entity_id: String,
    /// Domain-specific fields.
    pub payload: P,
    /// Version timestamp, the merge tie-breaker.
    pub updated_at: Timestamp,
    /// Client context that produced this version.
    pub origin: Origin,
    /// Provenance of this version.
    pub source: StateSource,
}

impl<P> SyncedEntityState<P> {
    /// Creates a new envelope.
    pub fn new(
        entity_id: impl Into<String>,
        payload: P,
        updated_at: Timestamp,
        origin: Origin,
        source: StateSource,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
            updated_at,
            origin,
            source,
        }
    }

    /// Returns true if this version wins a merge against `incumbent`.
    ///
    /// Strictly newer `updated_at` always wins. On equal timestamps the
    /// remotely-confirmed version is preferred over a locally-optimistic
    /// one; an exact tie keeps the incumbent.
    pub fn supersedes(&self, incumbent: &SyncedEntityState<P>) -> bool {
        if self.updated_at != incumbent.updated_at {
            return self.updated_at > incumbent.updated_at;
        }
        self.source.rank() > incumbent.source.rank()
    }
}

impl<P: Serialize> SyncedEntityState<P> {
    /// Erases the payload type into a JSON value.
    ///
    /// Broadcast frames carry this erased form so the transport stays
    /// payload-agnostic.
    pub fn erase(&self) -> Result<SyncedEntityState<serde_json::Value>, serde_json::Error> {
        Ok(SyncedEntityState {
            entity_id: self.entity_id.clone(),
            payload: serde_json::to_value(&self.payload)?,
            updated_at: self.updated_at,
            origin: self.origin.clone(),
            source: self.source,
        })
    }
}

impl SyncedEntityState<serde_json::Value> {
    /// Recovers a typed envelope from the erased form.
    pub fn decode<P: DeserializeOwned>(self) -> Result<SyncedEntityState<P>, serde_json::Error> {
        Ok(SyncedEntityState {
            entity_id: self.entity_id,
            payload: serde_json::from_value(self.payload)?,
            updated_at: self.updated_at,
            origin: self.origin,
            source: self.source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(updated_at: Timestamp, source: StateSource) -> SyncedEntityState<u32> {
        SyncedEntityState::new(
            "s-1",
            0u32,
            updated_at,
            Origin::new("dev-1", "term-1"),
            source,
        )
    }

    #[test]
    fn newer_timestamp_wins() {
        let old = state(100, StateSource::Backend);
        let new = state(200, StateSource::Local);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }

    #[test]
    fn backend_wins_timestamp_tie() {
        let local = state(100, StateSource::Local);
        let backend = state(100, StateSource::Backend);
        let peer = state(100, StateSource::Peer);

        assert!(backend.supersedes(&local));
        assert!(backend.supersedes(&peer));
        assert!(peer.supersedes(&local));
        assert!(!local.supersedes(&backend));
    }

    #[test]
    fn exact_tie_keeps_incumbent() {
        let a = state(100, StateSource::Peer);
        let b = state(100, StateSource::Peer);
        assert!(!a.supersedes(&b));
        assert!(!b.supersedes(&a));
    }

    #[test]
    fn erase_and_decode_round_trip() {
        let original = state(42, StateSource::Backend);
        let erased = original.erase().unwrap();
        let recovered: SyncedEntityState<u32> = erased.decode().unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn decode_wrong_shape_fails() {
        let erased = state(42, StateSource::Backend).erase().unwrap();
        let result: Result<SyncedEntityState<String>, _> = erased.decode();
        assert!(result.is_err());
    }

    fn any_source() -> impl Strategy<Value = StateSource> {
        prop_oneof![
            Just(StateSource::Backend),
            Just(StateSource::Peer),
            Just(StateSource::Local),
        ]
    }

    proptest! {
        /// No pair of versions can both win the merge against each
        /// other; without that, two stores could flip-flop forever.
        #[test]
        fn supersedes_is_asymmetric(
            at_a in 0i64..1_000, at_b in 0i64..1_000,
            src_a in any_source(), src_b in any_source(),
        ) {
            let a = state(at_a, src_a);
            let b = state(at_b, src_b);
            prop_assert!(!(a.supersedes(&b) && b.supersedes(&a)));
        }
    }
}
