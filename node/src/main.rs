// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use pocket_node::config::NodeConfig;
use pocket_node::ledger::{LedgerClient, SimLedger};
use pocket_node::mirror::MirrorStore;
use pocket_node::reconciler::{self, Reconciler};
use pocket_node::server::{build_router, AppState};
use pocket_node::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() {
    init_telemetry();

    let cfg = NodeConfig::from_env();
    tracing::info!("Initializing Pocket Node with config: {:?}", cfg);

    if let Some(path) = &cfg.event_log_path {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create data dir {:?}: {}", parent, e);
                std::process::exit(1);
            }
        }
    }

    let ledger = match SimLedger::open(cfg.owner, cfg.event_log_path.as_deref()) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            tracing::error!("Failed to open ledger: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Ledger at position {}", ledger.head_seq().await);

    let mirror = Arc::new(MirrorStore::new(cfg.owner));

    // Restore the mirror snapshot if present; the reconciler re-applies
    // anything between the snapshot's checkpoint and the ledger head.
    if let Some(path) = &cfg.mirror_snapshot_path {
        if path.exists() {
            match tokio::fs::read(path).await {
                Ok(data) => {
                    mirror.restore(&data);
                    tracing::info!("Mirror snapshot restored from {:?}", path);
                }
                Err(e) => tracing::error!("Failed to read mirror snapshot: {}", e),
            }
        }
    }

    let reconciler = Arc::new(Mutex::new(Reconciler::new(Arc::clone(&mirror), &cfg)));

    // Feed the reconciler: either follow a remote node's event stream
    // (read-replica mode) or replay the in-process ledger and follow live.
    if let Some(url) = cfg.ledger_url.clone() {
        tracing::info!("Follower mode: mirroring remote ledger at {}", url);
        let client = LedgerClient::new(url, cfg.auth_token.clone());
        let rec = Arc::clone(&reconciler);
        let tick_ms = cfg.defer_tick_ms;
        tokio::spawn(async move {
            reconciler::run_stream(rec, client, tick_ms).await;
        });
    } else {
        let start_seq = reconciler.lock().await.last_seq() + 1;
        let (history, live_rx) = ledger.subscribe(start_seq).await;
        let rec = Arc::clone(&reconciler);
        let tick_ms = cfg.defer_tick_ms;
        tokio::spawn(async move {
            reconciler::run(rec, history, live_rx, tick_ms).await;
        });
    }

    // Periodic mirror snapshot.
    if let (Some(path), Some(secs)) = (cfg.mirror_snapshot_path.clone(), cfg.auto_snapshot_interval_secs) {
        let mirror_clone = Arc::clone(&mirror);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(secs));
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                let data = mirror_clone.snapshot();
                let tmp = path.with_extension("tmp");
                let write = async {
                    tokio::fs::write(&tmp, &data).await?;
                    tokio::fs::rename(&tmp, &path).await
                };
                match write.await {
                    Ok(()) => tracing::debug!("Mirror snapshot saved to {:?}", path),
                    Err(e) => tracing::error!("Mirror snapshot failed: {}", e),
                }
            }
        });
    }

    let state = AppState {
        ledger,
        mirror,
        reconciler,
    };
    let app = build_router(state, cfg.auth_token.clone());

    let addr = cfg.bind_addr;
    tracing::info!("Listening on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
