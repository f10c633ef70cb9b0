// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Grant: standing authority from an owner to one delegate.

use crate::types::{Address, Amount};
use serde::{Deserialize, Serialize};

/// Bounded, revocable spending authority for a single delegate.
///
/// At most one active grant exists per (owner, delegate) pair. Re-granting
/// republishes the terms in place on the ledger; revoking then granting
/// again starts a fresh grant. The grant never mutates its own usage; that
/// belongs to [`crate::usage::DailyUsage`] and only the engine touches it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub owner: Address,
    pub delegate: Address,
    /// When set, every spend attempt queues for the owner's decision.
    pub requires_approval: bool,
    /// Ceiling on committed spend within one rolling 24-hour window.
    pub daily_limit: Amount,
    /// Display name chosen by the owner ("Alice's lunch card").
    pub name: String,
    /// Revocation is soft: the row survives with `active = false`.
    pub active: bool,
}

impl Grant {
    pub fn new(
        owner: Address,
        delegate: Address,
        requires_approval: bool,
        daily_limit: Amount,
        name: impl Into<String>,
    ) -> Self {
        Self {
            owner,
            delegate,
            requires_approval,
            daily_limit,
            name: name.into(),
            active: true,
        }
    }

    /// Republish terms in place. Identity fields are untouched.
    pub fn set_terms(&mut self, requires_approval: bool, daily_limit: Amount, name: impl Into<String>) {
        self.requires_approval = requires_approval;
        self.daily_limit = daily_limit;
        self.name = name.into();
        self.active = true;
    }

    pub fn revoke(&mut self) {
        self.active = false;
    }
}
