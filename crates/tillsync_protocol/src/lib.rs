//! # tillsync Protocol
//!
//! Synchronized-state envelope and mutation protocol types for tillsync.
//!
//! This crate provides:
//! - `SyncedEntityState` for cross-client state replication
//! - Cash-session and loyalty payloads
//! - `MutationRequest` / `Outcome` for idempotent remote mutations
//! - The outbound queue primitive shared with the external-sync connector
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod mutation;
mod outbox;
mod payload;

pub use envelope::{now_millis, Origin, StateSource, SyncedEntityState, Timestamp};
pub use mutation::{IdempotencyKey, KeyError, MutationOp, MutationRequest, Outcome};
pub use outbox::{OutboundQueue, OutboundQueueItem};
pub use payload::{CashSessionPayload, LoyaltyPayload, SessionStatus};
