// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Ledger event vocabulary.
//!
//! The ledger is the single source of truth; every state change it makes
//! is expressed as exactly one `LedgerEvent` in an append-only, ordered
//! log. The reconciler consumes this vocabulary and nothing else.
//!
//! # Invariants
//! - Events are immutable once emitted.
//! - `seq` is strictly monotonic per ledger and is the ordering and resume
//!   key; arrival order at the consumer carries no meaning.
//! - The enum is matched exhaustively everywhere, so an unknown event kind
//!   is a compile error, not a runtime surprise.

use crate::types::{Address, Amount, RequestId};
use serde::{Deserialize, Serialize};

/// The five domain events the ledger emits.
///
/// Externally tagged, so the same derive serves both the self-describing
/// JSON stream and the compact binary log encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// A grant was created or had its terms republished.
    GrantSet {
        delegate: Address,
        requires_approval: bool,
        daily_limit: Amount,
        name: String,
    },

    /// A grant was revoked (soft: the delegate row survives, inactive).
    GrantRevoked { delegate: Address },

    /// A spend attempt was queued for owner approval.
    SpendQueued {
        request_id: RequestId,
        delegate: Address,
        asset: Address,
        to: Address,
        amount: Amount,
        description: String,
    },

    /// Value moved. `request_id` is present when this resolves a queued
    /// request and absent on the auto-approved path.
    SpendCommitted {
        request_id: Option<RequestId>,
        actor: Address,
        asset: Address,
        to: Address,
        amount: Amount,
    },

    /// A queued request was refused: an explicit owner rejection, or an
    /// approval whose limit re-check failed with a terminal outcome.
    /// `reason` is the human-readable text surfaced to the delegate
    /// (owner-chosen, or a [`crate::error::DenyReason`] rendering).
    SpendDenied {
        request_id: RequestId,
        delegate: Address,
        reason: String,
    },
}

impl LedgerEvent {
    /// Human-readable event kind for logs and metrics labels.
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::GrantSet { .. } => "GrantSet",
            LedgerEvent::GrantRevoked { .. } => "GrantRevoked",
            LedgerEvent::SpendQueued { .. } => "SpendQueued",
            LedgerEvent::SpendCommitted { .. } => "SpendCommitted",
            LedgerEvent::SpendDenied { .. } => "SpendDenied",
        }
    }

    /// The delegate identity the event pertains to, used as the
    /// reconciler's partition key. `SpendCommitted` keys on the actor.
    pub fn partition_key(&self) -> Address {
        match self {
            LedgerEvent::GrantSet { delegate, .. }
            | LedgerEvent::GrantRevoked { delegate }
            | LedgerEvent::SpendQueued { delegate, .. }
            | LedgerEvent::SpendDenied { delegate, .. } => *delegate,
            LedgerEvent::SpendCommitted { actor, .. } => *actor,
        }
    }
}

/// An event plus its position in the ledger's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Ledger-native, strictly monotonic position.
    pub seq: u64,
    /// Ledger time the event was committed (unix seconds). Drives the
    /// mirror's usage projection; never consumer wall-clock time.
    pub timestamp: u64,
    pub event: LedgerEvent,
}
