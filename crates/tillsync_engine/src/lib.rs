//! # tillsync Engine
//!
//! Cross-client state synchronization and safe-mutation core for the
//! tillsync point-of-sale application.
//!
//! This crate provides:
//! - Observable per-entity state stores with last-writer-wins merges
//! - A reconciliation loop (poll + broadcast) per store
//! - A TTL resource lock manager for in-process mutual exclusion
//! - A durable mutation gateway with mandatory idempotency keys
//! - Safe operations composing lock and gateway (close session, adjust
//!   points, redeem reward)
//!
//! ## Architecture
//!
//! A UI action goes through the safe-operation façade: acquire the
//! entity's lock, issue the idempotent remote mutation, release the
//! lock. The confirmed state lands in the entity's observable store,
//! which notifies local subscribers and broadcasts to peer contexts.
//! Each peer's reconciliation loop merges the frame by timestamp; a
//! missed frame is recovered by the loop's backend poll.
//!
//! ## Key Invariants
//!
//! - A store's version timestamp never regresses
//! - One live lock per resource; expiry prevents starvation
//! - Every mutation carries an idempotency key; duplicates replay the
//!   prior result with one backend effect
//! - Broadcast is an optimization: polling alone converges

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod broadcast;
mod config;
mod error;
mod gateway;
mod lock;
mod reconciler;
mod safe_ops;
mod store;
mod stores;

pub use backend::{AuthoritativeSource, MockBackend, MutationBackend};
pub use broadcast::{
    BroadcastFrame, BroadcastReceiver, Broadcaster, LocalBroadcaster, NoopBroadcaster,
};
pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use gateway::MutationGateway;
pub use lock::{LockGuard, LockManager, SweeperHandle};
pub use reconciler::{Reconciler, ReconcilerState, ReconcilerStats};
pub use safe_ops::SafeOperations;
pub use store::{EntityStore, StoreStats, SubscriptionId};
pub use stores::{
    create_cash_session_store, create_loyalty_store, CashSessionHandle, LoyaltyHandle,
};
