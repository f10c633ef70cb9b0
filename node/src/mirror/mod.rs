// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Mirror Store: off-chain queryable projection of ledger state.
//!
//! Eventually consistent with the ledger's event log. Every mutation is an
//! idempotent upsert keyed by a stable id (delegate, request id, or ledger
//! position), never a blind append, so at-least-once delivery collapses
//! to exactly-once effect.

pub mod store;

pub use store::MirrorStore;

use pocket_kernel::event::SequencedEvent;
use pocket_kernel::types::{Address, Amount, RequestId};
use pocket_kernel::grant::Grant;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// Transient write failure; the reconciler retries with backoff and
    /// does not advance its checkpoint past the event.
    #[error("mirror store unavailable: {0}")]
    Unavailable(String),
    /// Permanent failure for this event (malformed beyond repair). Logged
    /// and parked; the stream continues.
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Write seam between the reconciler and the store.
///
/// The reconciler only needs these two operations; tests substitute a
/// fault-injecting implementation to exercise the retry path.
pub trait MirrorWriter: Send + Sync {
    fn apply(&self, ev: &SequencedEvent) -> Result<(), MirrorError>;
    fn has_request(&self, id: &RequestId) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// Grant projection plus the ledger position that last wrote it, used for
/// last-event-wins ordering under out-of-order arrival.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrantRow {
    pub grant: Grant,
    pub updated_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpendRequestRow {
    pub request_id: RequestId,
    pub delegate: Address,
    pub asset: Address,
    pub to: Address,
    pub amount: Amount,
    pub description: String,
    pub status: RequestStatus,
    /// Present once rejected; the human-readable reason.
    pub deny_reason: Option<String>,
    /// Unknown until the settlement confirmation fills it in.
    pub settlement_ref: Option<String>,
    pub created_seq: u64,
    pub created_at: u64,
    pub resolved_at: Option<u64>,
}

/// A committed, value-moving outcome. Keyed by the ledger position of its
/// `SpendCommitted` event, which makes redelivery a structural no-op.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRow {
    pub seq: u64,
    pub actor: Address,
    pub asset: Address,
    pub to: Address,
    pub amount: Amount,
    /// Back-reference to the resolved request, absent on the direct path.
    pub request_id: Option<RequestId>,
    pub settlement_ref: Option<String>,
    pub timestamp: u64,
}
