// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::extract::Request as AxumRequest;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;

use crate::api::*;
use crate::errors::NodeError;
use crate::ledger::sim::SubmitOutcome;
use crate::ledger::SimLedger;
use crate::mirror::MirrorStore;
use crate::reconciler::Reconciler;
use pocket_kernel::engine;
use pocket_kernel::types::{Address, RequestId};
use serde::Deserialize;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<SimLedger>,
    pub mirror: Arc<MirrorStore>,
    pub reconciler: Arc<Mutex<Reconciler<MirrorStore>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn auth_guard(
    State(token): State<Arc<Option<String>>>,
    req: AxumRequest,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(token_str) = &*token {
        let auth_header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|val| val.to_str().ok())
            .filter(|val| val.starts_with("Bearer "));

        if let Some(val) = auth_header {
            let provided = val.trim_start_matches("Bearer ");
            if provided == token_str {
                return Ok(next.run(req).await);
            }
        }
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: AppState, auth_token: Option<String>) -> Router {
    let mut app = Router::new()
        // Commands (owner surface)
        .route("/v1/delegates", post(add_delegate))
        .route("/v1/delegates/revoke", post(revoke_delegate))
        .route("/v1/spend", post(submit_spend))
        .route("/v1/spend/approve", post(approve_spend))
        .route("/v1/spend/reject", post(reject_spend))
        // Mirror reads
        .route("/v1/grants", get(list_grants))
        .route("/v1/grants/:delegate", get(get_grant))
        .route("/v1/grants/:delegate/allowance", get(get_allowance))
        .route("/v1/requests/pending", get(list_pending))
        .route("/v1/requests/:request_id", get(get_request))
        .route("/v1/transfers", get(list_transfers))
        // Stream + status
        .route("/v1/ledger/events", get(stream_ledger_events))
        .route("/v1/ledger/log", get(download_ledger_log))
        .route("/v1/reconciler/status", get(reconciler_status))
        .route("/v1/reconciler/replay", post(replay_parked))
        // Observability
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(token) = auth_token {
        tracing::info!("Auth Enabled: Bearer token required");
        let auth_state = Arc::new(Some(token));
        app = app.layer(from_fn_with_state(auth_state, auth_guard));
    } else {
        tracing::warn!("Auth Disabled: No token configured");
    }

    app
}

// --- Command handlers ---

async fn add_delegate(
    State(state): State<AppState>,
    Json(req): Json<AddDelegateRequest>,
) -> Result<Json<AddDelegateResponse>, NodeError> {
    let ev = state
        .ledger
        .set_grant(req.delegate, req.requires_approval, req.daily_limit, &req.name, now_secs())
        .await?;
    Ok(Json(AddDelegateResponse { seq: ev.seq }))
}

async fn revoke_delegate(
    State(state): State<AppState>,
    Json(req): Json<RevokeDelegateRequest>,
) -> Result<Json<RevokeDelegateResponse>, NodeError> {
    let ev = state.ledger.revoke_grant(req.delegate, now_secs()).await?;
    Ok(Json(RevokeDelegateResponse { revoked: ev.is_some() }))
}

async fn submit_spend(
    State(state): State<AppState>,
    Json(req): Json<SubmitSpendRequest>,
) -> Result<Json<SubmitSpendResponse>, NodeError> {
    let outcome = state
        .ledger
        .submit_spend(req.delegate, req.asset, req.to, req.amount, &req.description, now_secs())
        .await?;

    match outcome {
        SubmitOutcome::Committed { seq, settlement_ref } => {
            state.mirror.fill_transfer_ref(seq, &settlement_ref);
            Ok(Json(SubmitSpendResponse {
                status: "committed".into(),
                seq: Some(seq),
                request_id: None,
                settlement_ref: Some(settlement_ref),
            }))
        }
        SubmitOutcome::Queued { request_id } => Ok(Json(SubmitSpendResponse {
            status: "queued".into(),
            seq: None,
            request_id: Some(request_id),
            settlement_ref: None,
        })),
    }
}

async fn approve_spend(
    State(state): State<AppState>,
    Json(req): Json<ApproveSpendRequest>,
) -> Result<Json<ApproveSpendResponse>, NodeError> {
    let (seq, settlement_ref) = state.ledger.approve_request(req.request_id, now_secs()).await?;
    state.mirror.fill_settlement_ref(req.request_id, &settlement_ref);
    Ok(Json(ApproveSpendResponse { seq, settlement_ref }))
}

async fn reject_spend(
    State(state): State<AppState>,
    Json(req): Json<RejectSpendRequest>,
) -> Result<Json<RejectSpendResponse>, NodeError> {
    state.ledger.reject_request(req.request_id, &req.reason, now_secs()).await?;
    Ok(Json(RejectSpendResponse { success: true }))
}

// --- Mirror read handlers ---

#[derive(Deserialize)]
struct GrantsParams {
    owner: Option<Address>,
}

fn grant_view(state: &AppState, row: crate::mirror::GrantRow) -> GrantView {
    let usage = state
        .mirror
        .usage(&row.grant.delegate)
        .map(|u| u.effective_at(now_secs()))
        .unwrap_or_default();
    GrantView {
        owner: row.grant.owner,
        delegate: row.grant.delegate,
        requires_approval: row.grant.requires_approval,
        daily_limit: row.grant.daily_limit,
        name: row.grant.name,
        active: row.grant.active,
        spent_today: usage.spent,
        window_start: usage.window_start,
    }
}

async fn list_grants(
    State(state): State<AppState>,
    Query(params): Query<GrantsParams>,
) -> Result<Json<GrantsResponse>, NodeError> {
    let grants = state
        .mirror
        .list_grants(params.owner)
        .into_iter()
        .map(|row| grant_view(&state, row))
        .collect();
    Ok(Json(GrantsResponse { grants }))
}

async fn get_grant(
    State(state): State<AppState>,
    Path(delegate): Path<Address>,
) -> Result<Json<GrantView>, NodeError> {
    let row = state
        .mirror
        .get_grant(&delegate)
        .ok_or_else(|| NodeError::NotFound(format!("no grant for {delegate}")))?;
    Ok(Json(grant_view(&state, row)))
}

/// Remaining allowance, computed on the mirror's projection of the grant
/// and its current window.
async fn get_allowance(
    State(state): State<AppState>,
    Path(delegate): Path<Address>,
) -> Result<Json<AllowanceResponse>, NodeError> {
    let row = state
        .mirror
        .get_grant(&delegate)
        .ok_or_else(|| NodeError::NotFound(format!("no grant for {delegate}")))?;
    if !row.grant.active {
        return Err(NodeError::NotFound(format!("no active grant for {delegate}")));
    }
    let usage = state.mirror.usage(&delegate).unwrap_or_default();
    let available = engine::available(&row.grant, &usage, now_secs());
    Ok(Json(AllowanceResponse {
        delegate,
        daily_limit: row.grant.daily_limit,
        available,
    }))
}

async fn list_pending(State(state): State<AppState>) -> Result<Json<PendingRequestsResponse>, NodeError> {
    Ok(Json(PendingRequestsResponse {
        requests: state.mirror.list_pending_requests(),
    }))
}

async fn get_request(
    State(state): State<AppState>,
    Path(request_id): Path<RequestId>,
) -> Result<Json<crate::mirror::SpendRequestRow>, NodeError> {
    state
        .mirror
        .get_request(&request_id)
        .map(Json)
        .ok_or_else(|| NodeError::NotFound(format!("no such request: {request_id}")))
}

#[derive(Deserialize)]
struct TransfersParams {
    delegate: Option<Address>,
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(params): Query<TransfersParams>,
) -> Result<Json<TransfersResponse>, NodeError> {
    Ok(Json(TransfersResponse {
        transfers: state.mirror.list_transfers(params.delegate),
    }))
}

// --- Stream + status ---

#[derive(Deserialize)]
struct StreamParams {
    start_seq: Option<u64>,
}

/// NDJSON stream of ledger events from `start_seq`: history first, then
/// live. Events straddling the boundary are deduplicated by position.
async fn stream_ledger_events(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Body, NodeError> {
    let start_seq = params.start_seq.unwrap_or(1);
    let (history, mut live_rx) = state.ledger.subscribe(start_seq).await;

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(100);

    tokio::spawn(async move {
        let mut last_sent = 0u64;

        for ev in history {
            if let Ok(json) = serde_json::to_string(&ev) {
                if tx.send(json + "\n").await.is_err() {
                    tracing::debug!("Stream: client disconnected during history");
                    return;
                }
                last_sent = ev.seq;
            }
        }

        loop {
            match live_rx.recv().await {
                Ok(ev) => {
                    if ev.seq <= last_sent {
                        continue; // already sent from history
                    }
                    if let Ok(json) = serde_json::to_string(&ev) {
                        if tx.send(json + "\n").await.is_err() {
                            return;
                        }
                        last_sent = ev.seq;
                    }
                }
                Err(_) => break, // lagged or closed
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
    Ok(Body::from_stream(stream))
}

/// Raw event log download, for bootstrapping a fresh follower without
/// replaying the JSON stream.
async fn download_ledger_log(State(state): State<AppState>) -> Result<Body, NodeError> {
    let path = state
        .ledger
        .log_path()
        .await
        .ok_or_else(|| NodeError::InvalidInput("no durable event log configured".into()))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| NodeError::LedgerUnavailable(format!("failed to open event log: {e}")))?;

    Ok(Body::from_stream(ReaderStream::new(file)))
}

async fn reconciler_status(State(state): State<AppState>) -> Result<Json<ReconcilerStatusResponse>, NodeError> {
    let head_seq = state.ledger.head_seq().await;
    let status = state.reconciler.lock().await.status();
    Ok(Json(ReconcilerStatusResponse {
        head_seq,
        last_seq: status.last_seq,
        lag: head_seq.saturating_sub(status.last_seq),
        deferred: status.deferred,
        parked: status.parked,
    }))
}

/// Re-drive a parked event after the fault behind it was repaired.
async fn replay_parked(
    State(state): State<AppState>,
    Json(req): Json<ReplayParkedRequest>,
) -> Result<Json<ReplayParkedResponse>, NodeError> {
    let replayed = state.reconciler.lock().await.replay_parked(req.seq).await;
    Ok(Json(ReplayParkedResponse { replayed }))
}

async fn metrics_handler() -> String {
    crate::telemetry::get_metrics()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
