// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! pocket-kernel: deterministic delegated-spending authorization logic.
//!
//! Pure domain kernel for the Pocket allowance system: grant records,
//! rolling daily-usage accounting, the spend authorization engine, and the
//! ledger event vocabulary. There is no I/O and no ambient clock; time is
//! always an explicit parameter, so the same inputs decide the same way
//! anywhere (on the ledger, in the simulator, in a pre-flight check).

pub mod engine;
pub mod error;
pub mod event;
pub mod grant;
pub mod types;
pub mod usage;
