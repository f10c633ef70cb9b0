// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pocket_kernel::error::{DenyReason, KernelError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Terminal authorization outcome. Surfaced verbatim; not retryable.
    #[error("{0}")]
    Denied(DenyReason),
    /// Bad request payload. Rejected before any ledger command is issued.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Transient infrastructure failure; safe to retry the same command.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            NodeError::Denied(reason) => (StatusCode::FORBIDDEN, reason.to_string()),
            NodeError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            NodeError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            NodeError::LedgerUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            NodeError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<KernelError> for NodeError {
    fn from(e: KernelError) -> Self {
        NodeError::InvalidInput(e.to_string())
    }
}
