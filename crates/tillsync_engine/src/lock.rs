//! Process-local resource lock manager with TTL expiry.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A live lock entry.
#[derive(Debug, Clone, Copy)]
struct LockEntry {
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Mutual-exclusion table keyed by resource name.
///
/// Protects against concurrent calls *within this process only* (two
/// rapid clicks racing on the same terminal). Cross-process exclusivity
/// for the same resource is the backend idempotency key's job; that
/// asymmetry is deliberate. `acquire` is a non-blocking test-and-set
/// with no queueing.
///
/// A crashed holder cannot wedge a resource forever: entries expire
/// after their TTL and are treated as absent, with a background sweep
/// keeping the table from growing unbounded.
///
/// Inject as `Arc<LockManager>` rather than reaching for a global.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, LockEntry>>,
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to install a lock for `resource` with the given TTL.
    ///
    /// Returns `true` iff no live lock exists. Returns `false` without
    /// side effects when the resource is held; the caller must treat
    /// that as "busy" and fail fast or retry at a higher level.
    pub fn acquire(&self, resource: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut table = self.table.lock();

        match table.get(resource) {
            Some(entry) if !entry.is_expired(now) => false,
            _ => {
                table.insert(
                    resource.to_string(),
                    LockEntry {
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    /// Releases the lock for `resource`. Removing an absent lock is a
    /// no-op.
    pub fn release(&self, resource: &str) {
        self.table.lock().remove(resource);
    }

    /// Returns true if a live lock exists for `resource`.
    ///
    /// An expired entry is treated as absent and evicted here.
    pub fn is_locked(&self, resource: &str) -> bool {
        let now = Instant::now();
        let mut table = self.table.lock();

        match table.get(resource) {
            Some(entry) if entry.is_expired(now) => {
                table.remove(resource);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Runs `f` while holding the lock for `resource`.
    ///
    /// Fails with [`SyncError::ResourceBusy`] if the lock cannot be
    /// acquired; otherwise the lock is released on every exit path,
    /// including a panic inside `f`.
    pub fn with_lock<T>(
        self: &Arc<Self>,
        resource: &str,
        ttl: Duration,
        f: impl FnOnce() -> T,
    ) -> SyncResult<T> {
        let _guard = self.guard(resource, ttl)?;
        Ok(f())
    }

    /// RAII variant of [`LockManager::with_lock`] for callers that hold
    /// the lock across await points.
    pub fn guard(self: &Arc<Self>, resource: &str, ttl: Duration) -> SyncResult<LockGuard> {
        if !self.acquire(resource, ttl) {
            return Err(SyncError::busy(resource));
        }
        Ok(LockGuard {
            manager: Arc::clone(self),
            resource: resource.to_string(),
        })
    }

    /// Removes expired entries, returning how many were evicted.
    ///
    /// Advisory cleanup: `acquire` and `is_locked` already treat
    /// expired entries as absent.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - table.len();
        if evicted > 0 {
            debug!(evicted, "swept expired locks");
        }
        evicted
    }

    /// Number of entries currently in the table, expired or not.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Spawns a periodic expiry sweep on the current tokio runtime.
    ///
    /// The sweep stops when the returned handle is dropped or
    /// explicitly stopped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep_expired();
            }
        });
        SweeperHandle { task }
    }
}

/// Releases a held lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    resource: String,
}

impl LockGuard {
    /// The resource this guard holds.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.resource);
    }
}

/// Handle to a running lock sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
