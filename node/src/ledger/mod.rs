// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Ledger side of the node: the append-only event log, the in-process
//! simulated ledger that produces the event stream, and an HTTP client for
//! following a remote node's stream instead.

pub mod client;
pub mod event_log;
pub mod sim;

pub use client::LedgerClient;
pub use event_log::EventLogWriter;
pub use sim::SimLedger;
