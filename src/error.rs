// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed address or request id.
    #[error("invalid identifier")]
    InvalidId,
}

/// Why a spend attempt (or an approval) was refused.
///
/// These are terminal, user-visible outcomes; the `Display` strings are the
/// exact reasons surfaced to delegates and approvers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DenyReason {
    #[error("no such delegation")]
    NoSuchDelegation,
    #[error("daily limit exceeded")]
    DailyLimitExceeded,
    #[error("amount must be positive")]
    InvalidAmount,
}
