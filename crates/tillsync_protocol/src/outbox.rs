//! Outbound queue shared with the external-sync connector.

use crate::envelope::{now_millis, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A record queued for forwarding to an external system.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundQueueItem {
    /// Target external system.
    pub system_id: String,
    /// Kind of record ("sale", "customer", ...).
    pub entity_type: String,
    /// The record to forward.
    pub record: serde_json::Value,
    /// When the item was enqueued.
    pub enqueued_at: Timestamp,
}

/// FIFO queue of records awaiting external delivery.
///
/// Producers enqueue; the connector's flush path drains and forwards
/// under its own retry policy. One mutex guards the whole queue.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<OutboundQueueItem>>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a record for the given system.
    pub fn enqueue(
        &self,
        system_id: impl Into<String>,
        entity_type: impl Into<String>,
        record: serde_json::Value,
    ) {
        self.items.lock().push_back(OutboundQueueItem {
            system_id: system_id.into(),
            entity_type: entity_type.into(),
            record,
            enqueued_at: now_millis(),
        });
    }

    /// Removes and returns up to `limit` items in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<OutboundQueueItem> {
        let mut items = self.items.lock();
        let take = limit.min(items.len());
        items.drain(..take).collect()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
