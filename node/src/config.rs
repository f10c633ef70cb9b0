// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use pocket_kernel::types::Address;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Retry policy for transient mirror write failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Attempts before an event is parked for manual replay.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Exponential backoff cap.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    /// Bearer token for the HTTP surface. `None` disables auth.
    pub auth_token: Option<String>,
    /// Owner of the pooled account served by the in-process ledger.
    pub owner: Address,
    /// Append-only ledger event log. `None` keeps the log in memory only.
    pub event_log_path: Option<PathBuf>,
    /// Mirror store JSON snapshot, restored on boot.
    pub mirror_snapshot_path: Option<PathBuf>,
    /// Reconciler checkpoint (last processed ledger position).
    pub checkpoint_path: Option<PathBuf>,
    pub auto_snapshot_interval_secs: Option<u64>,
    /// Remote ledger node to follow. When set, the reconciler ingests that
    /// node's NDJSON event stream instead of the in-process ledger, making
    /// this node a read replica of the remote one.
    pub ledger_url: Option<String>,
    pub retry: RetryConfig,
    /// How long an out-of-order event may wait for its prerequisite before
    /// the unmatched-commit fallback applies.
    pub defer_window_secs: u64,
    /// Reconciler housekeeping tick (re-drives deferred events).
    pub defer_tick_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("static addr"),
            auth_token: None,
            owner: Address::zero(),
            event_log_path: None,
            mirror_snapshot_path: None,
            checkpoint_path: None,
            auto_snapshot_interval_secs: None,
            ledger_url: None,
            retry: RetryConfig::default(),
            defer_window_secs: 30,
            defer_tick_ms: 500,
        }
    }
}

impl NodeConfig {
    /// Defaults overridden from `POCKET_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(addr) = std::env::var("POCKET_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                cfg.bind_addr = parsed;
            } else {
                tracing::warn!("Ignoring unparseable POCKET_BIND_ADDR: {}", addr);
            }
        }
        if let Ok(token) = std::env::var("POCKET_AUTH_TOKEN") {
            cfg.auth_token = Some(token);
        }
        if let Ok(owner) = std::env::var("POCKET_OWNER") {
            match owner.parse() {
                Ok(parsed) => cfg.owner = parsed,
                Err(_) => tracing::warn!("Ignoring unparseable POCKET_OWNER: {}", owner),
            }
        }
        if let Ok(url) = std::env::var("POCKET_LEDGER_URL") {
            cfg.ledger_url = Some(url);
        }
        if let Ok(dir) = std::env::var("POCKET_DATA_DIR") {
            let dir = PathBuf::from(dir);
            cfg.event_log_path = Some(dir.join("events.log"));
            cfg.mirror_snapshot_path = Some(dir.join("mirror.json"));
            cfg.checkpoint_path = Some(dir.join("checkpoint.json"));
            cfg.auto_snapshot_interval_secs = Some(30);
        }
        cfg
    }
}
