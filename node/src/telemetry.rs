// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    // 1. Initialize Tracing (Logs)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pocket_node=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Initialize Metrics (Prometheus)
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Store handle for /metrics endpoint
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!("pocket_events_applied_total", "Ledger events applied to the mirror");
    metrics::describe_counter!("pocket_events_duplicate_total", "Redelivered events skipped by checkpoint");
    metrics::describe_counter!("pocket_events_deferred_total", "Events deferred awaiting a prerequisite");
    metrics::describe_counter!("pocket_events_parked_total", "Events parked after retry exhaustion");
    metrics::describe_counter!("pocket_events_poison_total", "Unparseable events skipped");
    metrics::describe_counter!("pocket_store_retry_total", "Transient mirror write retries");
    metrics::describe_gauge!("pocket_reconciler_checkpoint", "Last ledger position applied to the mirror");
    metrics::describe_gauge!("pocket_ledger_head", "Ledger head position");

    // Ensure at least one metric exists on startup
    metrics::gauge!("pocket_node_up", 1.0);
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
