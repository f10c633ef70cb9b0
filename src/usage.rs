// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! DailyUsage: rolling 24-hour spend counter.
//!
//! The window resets lazily. There is no background job: a spend attempt
//! whose timestamp falls outside the current window re-anchors the window
//! (and zeroes `spent`) before the attempt itself is accounted.

use crate::types::Amount;
use serde::{Deserialize, Serialize};

/// Accounting window length in seconds.
pub const WINDOW_SECS: u64 = 86_400;

/// Anchor `now` to the start of its accounting window.
pub fn floor_to_window(now: u64) -> u64 {
    now - now % WINDOW_SECS
}

/// Per-grant rolling counter. Created lazily alongside the grant; mutated
/// only by committed spends and window rollover.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    /// Start of the current accounting window (unix seconds).
    pub window_start: u64,
    /// Amount committed within the current window.
    pub spent: Amount,
}

impl DailyUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `now` falls outside `[window_start, window_start + 24h)`.
    pub fn is_stale(&self, now: u64) -> bool {
        now < self.window_start || now >= self.window_start + WINDOW_SECS
    }

    /// The usage as it would stand at `now`, after any lazy reset.
    ///
    /// Does not mutate `self`; the engine commits the rolled value only on
    /// an ALLOW decision.
    pub fn effective_at(&self, now: u64) -> DailyUsage {
        if self.is_stale(now) {
            DailyUsage {
                window_start: floor_to_window(now),
                spent: 0,
            }
        } else {
            *self
        }
    }

    /// Remaining headroom under `limit` at `now`.
    pub fn remaining(&self, limit: Amount, now: u64) -> Amount {
        let eff = self.effective_at(now);
        limit.saturating_sub(eff.spent)
    }
}
