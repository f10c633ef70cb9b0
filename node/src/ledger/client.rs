// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! HTTP client for a remote ledger node: issues commands against its
//! command surface and follows its NDJSON event stream.

use crate::api::{
    AddDelegateRequest, AddDelegateResponse, ApproveSpendRequest, ApproveSpendResponse,
    RejectSpendRequest, RejectSpendResponse, RevokeDelegateRequest, RevokeDelegateResponse,
    SubmitSpendRequest, SubmitSpendResponse,
};
use crate::errors::NodeError;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct LedgerClient {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl LedgerClient {
    pub fn new(url: String, auth_token: Option<String>) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            auth_token,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, NodeError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authed(self.client.post(&url).json(body))
            .send()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let msg = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("no error body")
                .to_string();
            if status.is_client_error() {
                return Err(NodeError::InvalidInput(format!("{status}: {msg}")));
            }
            return Err(NodeError::LedgerUnavailable(format!("{status}: {msg}")));
        }

        resp.json()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(e.to_string()))
    }

    // --- Commands ---

    pub async fn set_grant(&self, req: &AddDelegateRequest) -> Result<AddDelegateResponse, NodeError> {
        self.post_json("/v1/delegates", req).await
    }

    pub async fn revoke_grant(
        &self,
        req: &RevokeDelegateRequest,
    ) -> Result<RevokeDelegateResponse, NodeError> {
        self.post_json("/v1/delegates/revoke", req).await
    }

    pub async fn submit_spend(&self, req: &SubmitSpendRequest) -> Result<SubmitSpendResponse, NodeError> {
        self.post_json("/v1/spend", req).await
    }

    pub async fn approve_request(
        &self,
        req: &ApproveSpendRequest,
    ) -> Result<ApproveSpendResponse, NodeError> {
        self.post_json("/v1/spend/approve", req).await
    }

    pub async fn reject_request(&self, req: &RejectSpendRequest) -> Result<RejectSpendResponse, NodeError> {
        self.post_json("/v1/spend/reject", req).await
    }

    // --- Stream ---

    pub async fn head_seq(&self) -> Result<u64, NodeError> {
        let url = format!("{}/v1/reconciler/status", self.base_url);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NodeError::LedgerUnavailable(format!(
                "Status request failed: {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| NodeError::LedgerUnavailable(e.to_string()))?;
        Ok(body.get("head_seq").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    // We stream bytes for events to handle NDJSON manually via a line splitter
    pub async fn stream_events(&self, start_seq: u64) -> Result<reqwest::Response, NodeError> {
        let url = format!("{}/v1/ledger/events?start_seq={}", self.base_url, start_seq);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NodeError::LedgerUnavailable(format!(
                "Stream request failed: {}",
                resp.status()
            )));
        }

        Ok(resp)
    }
}
