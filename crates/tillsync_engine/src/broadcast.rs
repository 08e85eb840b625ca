//! Cross-context broadcast of state updates.
//!
//! Broadcast is a propagation-latency optimization, never a correctness
//! dependency: a reconciler on a polling-only transport still converges.

use parking_lot::Mutex;
use std::collections::HashMap;
use tillsync_protocol::{now_millis, Origin, SyncedEntityState, Timestamp};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// One state update in flight between client contexts.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    /// Channel the frame was published on.
    pub channel: String,
    /// Producer of the enclosed state version.
    pub origin: Origin,
    /// Payload-erased state envelope.
    pub state: SyncedEntityState<serde_json::Value>,
    /// When the frame was published.
    pub sent_at: Timestamp,
}

impl BroadcastFrame {
    /// Builds a frame for `state` on `channel`.
    pub fn new(channel: impl Into<String>, state: SyncedEntityState<serde_json::Value>) -> Self {
        Self {
            channel: channel.into(),
            origin: state.origin.clone(),
            state,
            sent_at: now_millis(),
        }
    }
}

/// Best-effort same-origin pub/sub keyed by channel name.
///
/// `publish` has no delivery guarantee; message order is preserved
/// within one channel between two given endpoints.
pub trait Broadcaster: Send + Sync {
    /// Fans a frame out to all other live subscribers of its channel.
    fn publish(&self, frame: BroadcastFrame);

    /// Registers for frames published on `channel`.
    fn subscribe(&self, channel: &str) -> BroadcastReceiver;
}

/// Receiving end of a channel subscription.
///
/// A receiver from a transport with no delivery (the no-op broadcaster)
/// simply never yields, so select loops fall through to their polling
/// arm.
pub struct BroadcastReceiver {
    rx: Option<broadcast::Receiver<BroadcastFrame>>,
}

impl BroadcastReceiver {
    /// A receiver that never yields a frame.
    pub fn silent() -> Self {
        Self { rx: None }
    }

    /// Waits for the next frame.
    ///
    /// Pends forever on a silent or closed channel; lagged receivers
    /// skip dropped frames (best-effort contract).
    pub async fn recv(&mut self) -> BroadcastFrame {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok(frame) => return frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "broadcast receiver lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return std::future::pending().await;
                }
            }
        }
    }
}

/// In-process fan-out over tokio broadcast channels, one per channel
/// name. Stands in for the browser BroadcastChannel between contexts
/// sharing this process.
#[derive(Debug, Default)]
pub struct LocalBroadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<BroadcastFrame>>>,
}

impl LocalBroadcaster {
    /// Creates a broadcaster with no channels yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BroadcastFrame> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Broadcaster for LocalBroadcaster {
    fn publish(&self, frame: BroadcastFrame) {
        let sender = self.sender(&frame.channel);
        // No subscribers is fine; delivery is best-effort.
        let _ = sender.send(frame);
    }

    fn subscribe(&self, channel: &str) -> BroadcastReceiver {
        BroadcastReceiver {
            rx: Some(self.sender(channel).subscribe()),
        }
    }
}

/// Transport for deployments without a broadcast primitive: publishes
/// vanish and subscriptions never yield. Reconcilers degrade to their
/// polling path.
#[derive(Debug, Default)]
pub struct NoopBroadcaster;

impl NoopBroadcaster {
    /// Creates the no-op broadcaster.
    pub fn new() -> Self {
        Self
    }
}

impl Broadcaster for NoopBroadcaster {
    fn publish(&self, frame: BroadcastFrame) {
        debug!(channel = %frame.channel, "broadcast unavailable, frame dropped");
    }

    fn subscribe(&self, _channel: &str) -> BroadcastReceiver {
        BroadcastReceiver::silent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tillsync_protocol::StateSource;

    fn frame(channel: &str, value: i64) -> BroadcastFrame {
        BroadcastFrame::new(
            channel,
            SyncedEntityState::new(
                "e-1",
                serde_json::json!(value),
                value,
                Origin::new("dev-1", "term-1"),
                StateSource::Peer,
            ),
        )
    }

    #[tokio::test]
    async fn delivers_in_order_within_channel() {
        let bus = LocalBroadcaster::new();
        let mut rx = bus.subscribe("cash:s-1");

        bus.publish(frame("cash:s-1", 1));
        bus.publish(frame("cash:s-1", 2));

        assert_eq!(rx.recv().await.state.updated_at, 1);
        assert_eq!(rx.recv().await.state.updated_at, 2);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = LocalBroadcaster::new();
        let mut cash = bus.subscribe("cash:s-1");
        let mut loyalty = bus.subscribe("loyalty:c-1");

        bus.publish(frame("loyalty:c-1", 7));

        assert_eq!(loyalty.recv().await.state.updated_at, 7);
        let timeout = tokio::time::timeout(Duration::from_millis(20), cash.recv()).await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = LocalBroadcaster::new();
        bus.publish(frame("cash:s-1", 1));

        // A later subscriber does not see earlier frames.
        let mut rx = bus.subscribe("cash:s-1");
        bus.publish(frame("cash:s-1", 2));
        assert_eq!(rx.recv().await.state.updated_at, 2);
    }

    #[tokio::test]
    async fn noop_receiver_never_yields() {
        let bus = NoopBroadcaster::new();
        let mut rx = bus.subscribe("cash:s-1");
        bus.publish(frame("cash:s-1", 1));

        let timeout = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(timeout.is_err());
    }
}
