// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Request/response types for the HTTP surface.

use crate::mirror::{SpendRequestRow, TransferRow};
use crate::reconciler::Parked;
use pocket_kernel::types::{Address, Amount, RequestId};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct AddDelegateRequest {
    pub delegate: Address,
    #[serde(default)]
    pub requires_approval: bool,
    pub daily_limit: Amount,
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct AddDelegateResponse {
    pub seq: u64,
}

#[derive(Serialize, Deserialize)]
pub struct RevokeDelegateRequest {
    pub delegate: Address,
}

#[derive(Serialize, Deserialize)]
pub struct RevokeDelegateResponse {
    /// False when the grant was already inactive or never existed.
    pub revoked: bool,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitSpendRequest {
    pub delegate: Address,
    pub asset: Address,
    pub to: Address,
    pub amount: Amount,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitSpendResponse {
    /// "committed" or "queued".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ApproveSpendRequest {
    pub request_id: RequestId,
}

#[derive(Serialize, Deserialize)]
pub struct ApproveSpendResponse {
    pub seq: u64,
    pub settlement_ref: String,
}

#[derive(Serialize, Deserialize)]
pub struct RejectSpendRequest {
    pub request_id: RequestId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Serialize, Deserialize)]
pub struct RejectSpendResponse {
    pub success: bool,
}

/// Mirror projection of a grant plus its current window.
#[derive(Serialize, Deserialize)]
pub struct GrantView {
    pub owner: Address,
    pub delegate: Address,
    pub requires_approval: bool,
    pub daily_limit: Amount,
    pub name: String,
    pub active: bool,
    pub spent_today: Amount,
    pub window_start: u64,
}

#[derive(Serialize, Deserialize)]
pub struct GrantsResponse {
    pub grants: Vec<GrantView>,
}

#[derive(Serialize, Deserialize)]
pub struct AllowanceResponse {
    pub delegate: Address,
    pub daily_limit: Amount,
    pub available: Amount,
}

#[derive(Serialize, Deserialize)]
pub struct PendingRequestsResponse {
    pub requests: Vec<SpendRequestRow>,
}

#[derive(Serialize, Deserialize)]
pub struct TransfersResponse {
    pub transfers: Vec<TransferRow>,
}

#[derive(Serialize, Deserialize)]
pub struct ReplayParkedRequest {
    pub seq: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ReplayParkedResponse {
    /// False when nothing is parked at that position.
    pub replayed: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ReconcilerStatusResponse {
    /// Ledger head position.
    pub head_seq: u64,
    /// Highest position the mirror reflects.
    pub last_seq: u64,
    pub lag: u64,
    pub deferred: usize,
    pub parked: Vec<Parked>,
}
