//! Error types for the sync core.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync core.
///
/// A stale merge candidate is not an error: it is discarded silently
/// and shows up only in logs and store counters.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Another in-process caller holds the lock for this resource.
    ///
    /// Fail fast and let the user retry; do not reuse the original
    /// idempotency key unless the original intent truly repeats.
    #[error("resource busy: {resource}")]
    ResourceBusy {
        /// The contended resource key.
        resource: String,
    },

    /// The backend validated the request and refused it (session
    /// already closed, reward already redeemed). Never retried.
    #[error("remote rejected: {0}")]
    RemoteRejected(String),

    /// Network or timeout failure before the backend answered.
    ///
    /// Safe to retry with the *same* idempotency key; the mutation
    /// contract guarantees at most one effect.
    #[error("remote unavailable: {message}")]
    RemoteUnavailable {
        /// Underlying failure description.
        message: String,
    },

    /// A broadcast frame or backend value failed to decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// A lifecycle method was called from the wrong state.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },
}

impl SyncError {
    /// Creates a `RemoteUnavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `ResourceBusy` error.
    pub fn busy(resource: impl Into<String>) -> Self {
        Self::ResourceBusy {
            resource: resource.into(),
        }
    }

    /// Returns true if this error may be retried with the same
    /// idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RemoteUnavailable { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Codec(err.to_string())
    }
}
