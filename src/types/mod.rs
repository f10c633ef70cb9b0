// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod id;

pub use id::{Address, RequestId};

/// Monetary amount in the smallest currency unit.
///
/// The ledger this crate mirrors uses 256-bit amounts; 128 bits is enough
/// for any realistic allowance while keeping arithmetic native. All amount
/// math in this crate is overflow-checked.
pub type Amount = u128;
