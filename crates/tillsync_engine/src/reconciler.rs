//! Per-store reconciliation loop.

use crate::backend::AuthoritativeSource;
use crate::broadcast::{BroadcastFrame, Broadcaster};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::EntityStore;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tillsync_protocol::{StateSource, SyncedEntityState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle states of a reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Not running.
    Stopped,
    /// Performing the initial authoritative fetch.
    Starting,
    /// Waiting for the next timer tick or peer frame.
    Polling,
    /// Merging a received candidate into the store.
    Reconciling,
}

impl ReconcilerState {
    fn name(self) -> &'static str {
        match self {
            ReconcilerState::Stopped => "Stopped",
            ReconcilerState::Starting => "Starting",
            ReconcilerState::Polling => "Polling",
            ReconcilerState::Reconciling => "Reconciling",
        }
    }
}

/// Counters describing a reconciler's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Successful backend polls.
    pub polls: u64,
    /// Polls that failed and were skipped.
    pub poll_failures: u64,
    /// Peer frames received (own-origin frames excluded).
    pub peer_frames: u64,
    /// Peer frames that won the merge.
    pub peer_applied: u64,
}

struct Inner<P> {
    store: Arc<EntityStore<P>>,
    source: Arc<dyn AuthoritativeSource<P>>,
    broadcaster: Arc<dyn Broadcaster>,
    channel: String,
    config: SyncConfig,
    state: RwLock<ReconcilerState>,
    stats: Mutex<ReconcilerStats>,
}

/// Keeps one store converged with the authoritative backend.
///
/// Runs a background task that polls the backend on an interval and
/// merges peer frames from the broadcast channel out of band. Both
/// paths apply the same last-writer-wins rule through the store, so a
/// missed broadcast (sleeping tab, no transport, other device) is
/// recovered by the next poll.
pub struct Reconciler<P> {
    inner: Arc<Inner<P>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl<P> Reconciler<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a stopped reconciler for `store`, polling `source` and
    /// listening on `channel`.
    pub fn new(
        store: Arc<EntityStore<P>>,
        source: Arc<dyn AuthoritativeSource<P>>,
        broadcaster: Arc<dyn Broadcaster>,
        channel: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                broadcaster,
                channel: channel.into(),
                config,
                state: RwLock::new(ReconcilerState::Stopped),
                stats: Mutex::new(ReconcilerStats::default()),
            }),
            task: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReconcilerState {
        *self.inner.state.read()
    }

    /// Activity counters.
    pub fn stats(&self) -> ReconcilerStats {
        *self.inner.stats.lock()
    }

    /// Starts the loop: one immediate authoritative fetch, then
    /// interval polling plus out-of-band peer merges.
    ///
    /// Fails if already running, or if the initial fetch fails (the
    /// reconciler is left `Stopped` and may be started again).
    pub async fn start(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.write();
            if *state != ReconcilerState::Stopped {
                return Err(SyncError::InvalidStateTransition {
                    from: state.name(),
                    to: "Starting",
                });
            }
            *state = ReconcilerState::Starting;
        }

        let entity_id = self.inner.store.current().entity_id;
        match self.inner.source.fetch(&entity_id).await {
            Ok(state) => {
                self.inner.apply_backend_state(state);
                self.inner.stats.lock().polls += 1;
            }
            Err(e) => {
                *self.inner.state.write() = ReconcilerState::Stopped;
                return Err(e);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Subscribe before spawning so frames published right after
        // start() returns already have a live subscriber.
        let frames = self.inner.broadcaster.subscribe(&self.inner.channel);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, entity_id, frames, shutdown_rx));

        *self.task.lock() = Some(handle);
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.inner.state.write() = ReconcilerState::Polling;
        info!(channel = %self.inner.channel, "reconciler started");
        Ok(())
    }

    /// Stops the loop. Safe from any state, idempotent.
    ///
    /// Cancels the interval timer and the channel subscription; a poll
    /// response in flight at the moment of the stop is discarded, not
    /// applied.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.lock().take() {
            // The loop only applies updates between await points, so
            // aborting here cannot leave a merge half-done.
            task.abort();
        }
        let mut state = self.inner.state.write();
        if *state != ReconcilerState::Stopped {
            info!(channel = %self.inner.channel, "reconciler stopped");
            *state = ReconcilerState::Stopped;
        }
    }
}

impl<P> Drop for Reconciler<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl<P> Inner<P>
where
    P: Clone + Serialize + Send + Sync,
{
    /// Applies a server-stamped state and, if it won the merge,
    /// republishes it for peers.
    fn apply_backend_state(&self, state: SyncedEntityState<P>) {
        if self.store.apply_authoritative(state) {
            self.republish(self.store.current());
        }
    }

    fn republish(&self, state: SyncedEntityState<P>) {
        match state.erase() {
            Ok(mut erased) => {
                erased.origin = self.config.origin.clone();
                self.broadcaster
                    .publish(BroadcastFrame::new(self.channel.clone(), erased));
            }
            Err(e) => warn!(channel = %self.channel, error = %e, "failed to encode frame"),
        }
    }
}

async fn run_loop<P>(
    inner: Arc<Inner<P>>,
    entity_id: String,
    mut frames: crate::broadcast::BroadcastReceiver,
    mut shutdown: watch::Receiver<bool>,
) where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let period = inner.config.poll_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            _ = ticker.tick() => {
                *inner.state.write() = ReconcilerState::Reconciling;
                match inner.source.fetch(&entity_id).await {
                    Ok(state) => {
                        inner.apply_backend_state(state);
                        inner.stats.lock().polls += 1;
                    }
                    Err(e) => {
                        // Degraded path: correctness comes from the
                        // next tick.
                        warn!(channel = %inner.channel, error = %e, "poll failed");
                        inner.stats.lock().poll_failures += 1;
                    }
                }
                *inner.state.write() = ReconcilerState::Polling;
            }

            frame = frames.recv() => {
                if frame.origin == inner.config.origin {
                    continue;
                }
                *inner.state.write() = ReconcilerState::Reconciling;
                inner.stats.lock().peer_frames += 1;
                match frame.state.decode::<P>() {
                    Ok(mut candidate) => {
                        candidate.source = StateSource::Peer;
                        if inner.store.apply_update(candidate) {
                            inner.stats.lock().peer_applied += 1;
                            debug!(channel = %inner.channel, "peer state applied");
                        }
                    }
                    Err(e) => {
                        warn!(channel = %inner.channel, error = %e, "undecodable peer frame");
                    }
                }
                *inner.state.write() = ReconcilerState::Polling;
            }
        }
    }
}
