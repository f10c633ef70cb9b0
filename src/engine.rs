// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Authorization engine.
//!
//! Pure decision logic: given a grant, its current usage and a spend
//! attempt `(amount, now)`, produce exactly one [`Decision`]. The ledger
//! executes this atomically per grant; it is reproduced here so it can be
//! run for simulation, for an alternate ledger backend, and for pre-flight
//! checks before command submission.
//!
//! # Invariants
//! - Only `Allow` carries (and therefore commits) mutated usage.
//! - `Queue` and `Deny` never touch usage.
//! - After any committed spend, `spent <= daily_limit`.
//! - The caller owns atomicity: decide-and-commit must be serialized per
//!   grant key.

use crate::error::DenyReason;
use crate::grant::Grant;
use crate::types::Amount;
use crate::usage::DailyUsage;

/// Outcome of a spend attempt or an approval re-check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Spend is authorized. `usage` is the post-commit counter the caller
    /// must store atomically with the value movement.
    Allow { usage: DailyUsage },
    /// The grant requires owner approval; queue a spend request. The daily
    /// limit is deliberately NOT checked here: it is re-checked with
    /// current terms at approval time, because terms may change in between.
    Queue,
    /// Refused. Terminal and user-visible; never retried automatically.
    Deny { reason: DenyReason },
}

impl Decision {
    pub fn deny(reason: DenyReason) -> Self {
        Decision::Deny { reason }
    }
}

/// Decide a delegate's direct spend attempt.
///
/// `grant` is `None` when no grant row exists for the delegate. Inactive
/// and missing grants are indistinguishable to the caller by design.
pub fn decide(grant: Option<&Grant>, usage: &DailyUsage, amount: Amount, now: u64) -> Decision {
    let grant = match grant {
        Some(g) if g.active => g,
        _ => return Decision::deny(DenyReason::NoSuchDelegation),
    };
    if amount == 0 {
        return Decision::deny(DenyReason::InvalidAmount);
    }
    if grant.requires_approval {
        return Decision::Queue;
    }
    check_limit(grant, usage, amount, now)
}

/// Re-check a previously queued request at approval time.
///
/// Runs against the *current* grant and usage, not the snapshot taken when
/// the request was queued, so a limit lowered after queuing is honored.
/// Approval never bypasses the limit.
pub fn decide_approval(grant: Option<&Grant>, usage: &DailyUsage, amount: Amount, now: u64) -> Decision {
    let grant = match grant {
        Some(g) if g.active => g,
        _ => return Decision::deny(DenyReason::NoSuchDelegation),
    };
    if amount == 0 {
        return Decision::deny(DenyReason::InvalidAmount);
    }
    check_limit(grant, usage, amount, now)
}

/// Remaining allowance for the grant's effective window at `now`.
///
/// Zero for inactive grants. Mirrors the ledger's allowance view.
pub fn available(grant: &Grant, usage: &DailyUsage, now: u64) -> Amount {
    if !grant.active {
        return 0;
    }
    usage.remaining(grant.daily_limit, now)
}

fn check_limit(grant: &Grant, usage: &DailyUsage, amount: Amount, now: u64) -> Decision {
    // Lazy window roll happens on the effective copy; it is only persisted
    // if the decision is Allow.
    let effective = usage.effective_at(now);
    match effective.spent.checked_add(amount) {
        Some(total) if total <= grant.daily_limit => Decision::Allow {
            usage: DailyUsage {
                window_start: effective.window_start,
                spent: total,
            },
        },
        // Overflow cannot be within any limit; fold it into the same denial.
        _ => Decision::deny(DenyReason::DailyLimitExceeded),
    }
}
