//! Durable mutation gateway: idempotent remote calls with timeout and
//! bounded retry.

use crate::backend::MutationBackend;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{IdempotencyKey, MutationOp, MutationRequest, Outcome};
use tracing::{debug, warn};

/// Issues state-changing operations to the backend through idempotent,
/// named remote procedures.
///
/// The gateway owns the timeout and the transient-failure retry policy.
/// A retry run reuses the original idempotency key, so the backend
/// applies at most one effect no matter how many attempts are made.
/// The default policy is no retries: safe operations call the gateway
/// while holding a resource lock, and silent retries would stretch the
/// hold time.
pub struct MutationGateway {
    backend: Arc<dyn MutationBackend>,
    timeout: Duration,
    retry: RetryConfig,
}

impl MutationGateway {
    /// Creates a gateway over `backend`.
    pub fn new(backend: Arc<dyn MutationBackend>, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            backend,
            timeout,
            retry,
        }
    }

    /// Executes `op`, generating a fresh idempotency key when the
    /// caller supplies none.
    ///
    /// A timeout converts to [`SyncError::RemoteUnavailable`]; the
    /// resource's true state is then resolved by the next
    /// reconciliation poll.
    pub async fn execute(
        &self,
        op: MutationOp,
        key: Option<IdempotencyKey>,
    ) -> SyncResult<Outcome> {
        let key = key.unwrap_or_else(IdempotencyKey::generate);
        let request = MutationRequest::new(op, key);

        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt);
                debug!(
                    op = request.op.name(),
                    attempt,
                    ?delay,
                    "retrying transient gateway failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.call_once(&request).await {
                Ok(outcome) => {
                    if outcome.replayed {
                        debug!(
                            op = request.op.name(),
                            key = %request.idempotency_key,
                            "duplicate idempotency key, prior result replayed"
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    warn!(op = request.op.name(), error = %e, "gateway call failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::unavailable("no gateway attempts made")))
    }

    async fn call_once(&self, request: &MutationRequest) -> SyncResult<Outcome> {
        match tokio::time::timeout(self.timeout, self.backend.mutate(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::unavailable(format!(
                "{} timed out after {:?}",
                request.op.name(),
                self.timeout
            ))),
        }
    }
}
