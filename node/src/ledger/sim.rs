// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process simulated ledger.
//!
//! Serializes commands per delegate, runs the kernel's authorization engine
//! against authoritative state, and emits a totally ordered event stream.
//!
//! # Invariants
//! - Events are durably appended to the log BEFORE the command returns.
//! - `seq` is contiguous from 1 with no gaps; assignment happens under the
//!   log lock.
//! - Commands on the same delegate never interleave: all state reads and
//!   writes for a decision happen under that delegate's cell lock.
//!
//! Lock order: cell -> requests -> log. Never acquire in any other order.

use crate::errors::NodeError;
use crate::ledger::event_log::EventLogWriter;
use pocket_kernel::engine::{self, Decision};
use pocket_kernel::error::DenyReason;
use pocket_kernel::event::{LedgerEvent, SequencedEvent};
use pocket_kernel::grant::Grant;
use pocket_kernel::types::{Address, Amount, RequestId};
use pocket_kernel::usage::DailyUsage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};

/// Authoritative per-delegate state, guarded by one async mutex so a
/// decision and its commit are a single critical section.
#[derive(Default)]
struct GrantCell {
    grant: Option<Grant>,
    usage: DailyUsage,
}

#[derive(Clone)]
enum RequestState {
    Pending,
    Approved { seq: u64, settlement_ref: String },
    Rejected,
}

#[derive(Clone)]
struct PendingRequest {
    delegate: Address,
    asset: Address,
    to: Address,
    amount: Amount,
    state: RequestState,
}

struct LogState {
    writer: Option<EventLogWriter>,
    entries: Vec<SequencedEvent>,
    next_seq: u64,
    /// Settlement references by the seq of their `SpendCommitted` event.
    refs: HashMap<u64, String>,
}

/// Outcome of a direct spend command.
pub enum SubmitOutcome {
    /// Value moved immediately.
    Committed { seq: u64, settlement_ref: String },
    /// Parked for the owner's decision.
    Queued { request_id: RequestId },
}

pub struct SimLedger {
    owner: Address,
    cells: RwLock<HashMap<Address, Arc<Mutex<GrantCell>>>>,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
    log: Mutex<LogState>,
    events_tx: broadcast::Sender<SequencedEvent>,
}

impl SimLedger {
    /// Open the ledger, replaying the durable log (if any) to rebuild
    /// authoritative state. Sequence numbering resumes after the last
    /// recovered event.
    pub fn open(owner: Address, log_path: Option<&Path>) -> Result<Self, NodeError> {
        let (writer, recovered) = match log_path {
            Some(path) => {
                let (w, events) = EventLogWriter::open(path)
                    .map_err(|e| NodeError::LedgerUnavailable(format!("event log open failed: {e}")))?;
                (Some(w), events)
            }
            None => (None, Vec::new()),
        };

        let (events_tx, _) = broadcast::channel(1024);
        let next_seq = recovered.last().map(|ev| ev.seq + 1).unwrap_or(1);

        // Replay into plain maps before anything is shared or locked.
        let mut cells: HashMap<Address, GrantCell> = HashMap::new();
        let mut requests = HashMap::new();
        let mut refs = HashMap::new();

        for ev in &recovered {
            match &ev.event {
                LedgerEvent::GrantSet {
                    delegate,
                    requires_approval,
                    daily_limit,
                    name,
                } => {
                    let cell = cells.entry(*delegate).or_default();
                    match &mut cell.grant {
                        Some(g) => g.set_terms(*requires_approval, *daily_limit, name),
                        None => cell.grant = Some(Grant::new(owner, *delegate, *requires_approval, *daily_limit, name)),
                    }
                }
                LedgerEvent::GrantRevoked { delegate } => {
                    if let Some(g) = cells.entry(*delegate).or_default().grant.as_mut() {
                        g.revoke();
                    }
                }
                LedgerEvent::SpendQueued {
                    request_id,
                    delegate,
                    asset,
                    to,
                    amount,
                    ..
                } => {
                    requests.insert(
                        *request_id,
                        PendingRequest {
                            delegate: *delegate,
                            asset: *asset,
                            to: *to,
                            amount: *amount,
                            state: RequestState::Pending,
                        },
                    );
                }
                LedgerEvent::SpendCommitted {
                    request_id, actor, amount, ..
                } => {
                    let cell = cells.entry(*actor).or_default();
                    let mut eff = cell.usage.effective_at(ev.timestamp);
                    eff.spent = eff.spent.saturating_add(*amount);
                    cell.usage = eff;

                    let settlement_ref = derive_settlement_ref(ev.seq);
                    refs.insert(ev.seq, settlement_ref.clone());
                    if let Some(id) = request_id {
                        if let Some(req) = requests.get_mut(id) {
                            req.state = RequestState::Approved {
                                seq: ev.seq,
                                settlement_ref,
                            };
                        }
                    }
                }
                LedgerEvent::SpendDenied { request_id, .. } => {
                    if let Some(req) = requests.get_mut(request_id) {
                        req.state = RequestState::Rejected;
                    }
                }
            }
        }

        Ok(Self {
            owner,
            cells: RwLock::new(
                cells
                    .into_iter()
                    .map(|(addr, cell)| (addr, Arc::new(Mutex::new(cell))))
                    .collect(),
            ),
            requests: Mutex::new(requests),
            log: Mutex::new(LogState {
                writer,
                entries: recovered,
                next_seq,
                refs,
            }),
            events_tx,
        })
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    fn cell(&self, delegate: Address) -> Arc<Mutex<GrantCell>> {
        {
            let cells = self.cells.read().unwrap_or_else(|p| p.into_inner());
            if let Some(cell) = cells.get(&delegate) {
                return Arc::clone(cell);
            }
        }
        let mut cells = self.cells.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(cells.entry(delegate).or_default())
    }

    /// Assign a seq, durably append, then broadcast. The event exists on
    /// disk before any consumer (or the caller) observes it.
    async fn emit(&self, build: impl FnOnce(u64) -> LedgerEvent, now: u64) -> Result<SequencedEvent, NodeError> {
        let mut log = self.log.lock().await;
        let seq = log.next_seq;
        let ev = SequencedEvent {
            seq,
            timestamp: now,
            event: build(seq),
        };
        if let Some(writer) = log.writer.as_mut() {
            writer
                .append(&ev)
                .map_err(|e| NodeError::LedgerUnavailable(format!("event log append failed: {e}")))?;
        }
        log.next_seq = seq + 1;
        log.entries.push(ev.clone());
        drop(log);

        metrics::gauge!("pocket_ledger_head", seq as f64);
        // Lagging subscribers see a RecvError and re-subscribe from their
        // checkpoint; send failure just means nobody is listening yet.
        let _ = self.events_tx.send(ev.clone());
        Ok(ev)
    }

    // --- Commands ---

    /// Create or replace the delegate's grant. Re-setting a revoked grant
    /// reactivates it.
    pub async fn set_grant(
        &self,
        delegate: Address,
        requires_approval: bool,
        daily_limit: Amount,
        name: &str,
        now: u64,
    ) -> Result<SequencedEvent, NodeError> {
        if delegate.is_zero() {
            return Err(NodeError::InvalidInput("delegate must not be the zero address".into()));
        }
        let cell = self.cell(delegate);
        let mut cell = cell.lock().await;
        match &mut cell.grant {
            Some(g) => g.set_terms(requires_approval, daily_limit, name),
            None => cell.grant = Some(Grant::new(self.owner, delegate, requires_approval, daily_limit, name)),
        }
        self.emit(
            |_| LedgerEvent::GrantSet {
                delegate,
                requires_approval,
                daily_limit,
                name: name.to_string(),
            },
            now,
        )
        .await
    }

    /// Deactivate the delegate's grant. Revoking an absent or already
    /// inactive grant succeeds without emitting anything.
    pub async fn revoke_grant(&self, delegate: Address, now: u64) -> Result<Option<SequencedEvent>, NodeError> {
        let cell = self.cell(delegate);
        let mut cell = cell.lock().await;
        match &mut cell.grant {
            Some(g) if g.active => {
                g.revoke();
                let ev = self.emit(|_| LedgerEvent::GrantRevoked { delegate }, now).await?;
                Ok(Some(ev))
            }
            _ => Ok(None),
        }
    }

    /// A delegate asks to move value. Runs the authorization engine under
    /// the delegate's cell lock; a denied command emits nothing.
    pub async fn submit_spend(
        &self,
        delegate: Address,
        asset: Address,
        to: Address,
        amount: Amount,
        description: &str,
        now: u64,
    ) -> Result<SubmitOutcome, NodeError> {
        let cell = self.cell(delegate);
        let mut cell = cell.lock().await;

        match engine::decide(cell.grant.as_ref(), &cell.usage, amount, now) {
            Decision::Deny { reason } => Err(NodeError::Denied(reason)),
            Decision::Queue => {
                let mut requests = self.requests.lock().await;
                let ev = self
                    .emit(
                        |seq| LedgerEvent::SpendQueued {
                            request_id: derive_request_id(delegate, asset, to, amount, seq),
                            delegate,
                            asset,
                            to,
                            amount,
                            description: description.to_string(),
                        },
                        now,
                    )
                    .await?;
                let LedgerEvent::SpendQueued { request_id, .. } = ev.event else {
                    return Err(NodeError::Internal);
                };
                requests.insert(
                    request_id,
                    PendingRequest {
                        delegate,
                        asset,
                        to,
                        amount,
                        state: RequestState::Pending,
                    },
                );
                Ok(SubmitOutcome::Queued { request_id })
            }
            Decision::Allow { usage } => {
                let ev = self
                    .emit(
                        |_| LedgerEvent::SpendCommitted {
                            request_id: None,
                            actor: delegate,
                            asset,
                            to,
                            amount,
                        },
                        now,
                    )
                    .await?;
                // Commit the counter only after the durable append succeeded.
                cell.usage = usage;
                let settlement_ref = derive_settlement_ref(ev.seq);
                self.log.lock().await.refs.insert(ev.seq, settlement_ref.clone());
                Ok(SubmitOutcome::Committed {
                    seq: ev.seq,
                    settlement_ref,
                })
            }
        }
    }

    /// Owner approves a queued request. The limit is re-checked against the
    /// grant and usage as of now; on denial the request stays pending and
    /// no event is emitted, so a later retry can succeed.
    pub async fn approve_request(&self, request_id: RequestId, now: u64) -> Result<(u64, String), NodeError> {
        let snapshot = {
            let requests = self.requests.lock().await;
            match requests.get(&request_id) {
                None => return Err(NodeError::NotFound(format!("no such request: {request_id}"))),
                Some(req) => match &req.state {
                    // Idempotent: re-approving returns the original outcome.
                    RequestState::Approved { seq, settlement_ref } => return Ok((*seq, settlement_ref.clone())),
                    RequestState::Rejected => {
                        return Err(NodeError::InvalidInput("request already rejected".into()));
                    }
                    RequestState::Pending => req.clone(),
                },
            }
        };

        let cell = self.cell(snapshot.delegate);
        let mut cell = cell.lock().await;
        // Re-check under the cell lock; a concurrent decision may have landed.
        let mut requests = self.requests.lock().await;
        let Some(req) = requests.get_mut(&request_id) else {
            return Err(NodeError::NotFound(format!("no such request: {request_id}")));
        };
        if let RequestState::Approved { seq, settlement_ref } = &req.state {
            return Ok((*seq, settlement_ref.clone()));
        }
        if matches!(req.state, RequestState::Rejected) {
            return Err(NodeError::InvalidInput("request already rejected".into()));
        }

        match engine::decide_approval(cell.grant.as_ref(), &cell.usage, snapshot.amount, now) {
            Decision::Deny { reason } => Err(NodeError::Denied(reason)),
            Decision::Queue => Err(NodeError::Internal),
            Decision::Allow { usage } => {
                let ev = self
                    .emit(
                        |_| LedgerEvent::SpendCommitted {
                            request_id: Some(request_id),
                            actor: snapshot.delegate,
                            asset: snapshot.asset,
                            to: snapshot.to,
                            amount: snapshot.amount,
                        },
                        now,
                    )
                    .await?;
                cell.usage = usage;
                let settlement_ref = derive_settlement_ref(ev.seq);
                req.state = RequestState::Approved {
                    seq: ev.seq,
                    settlement_ref: settlement_ref.clone(),
                };
                self.log.lock().await.refs.insert(ev.seq, settlement_ref.clone());
                Ok((ev.seq, settlement_ref))
            }
        }
    }

    /// Owner rejects a queued request. Rejecting twice is a no-op.
    pub async fn reject_request(&self, request_id: RequestId, reason: &str, now: u64) -> Result<(), NodeError> {
        let mut requests = self.requests.lock().await;
        let Some(req) = requests.get_mut(&request_id) else {
            return Err(NodeError::NotFound(format!("no such request: {request_id}")));
        };
        match &req.state {
            RequestState::Approved { .. } => Err(NodeError::InvalidInput("request already approved".into())),
            RequestState::Rejected => Ok(()),
            RequestState::Pending => {
                let delegate = req.delegate;
                req.state = RequestState::Rejected;
                self.emit(
                    |_| LedgerEvent::SpendDenied {
                        request_id,
                        delegate,
                        reason: reason.to_string(),
                    },
                    now,
                )
                .await?;
                Ok(())
            }
        }
    }

    // --- Views ---

    pub async fn head_seq(&self) -> u64 {
        self.log.lock().await.next_seq.saturating_sub(1)
    }

    /// Path of the durable log, when one is configured.
    pub async fn log_path(&self) -> Option<std::path::PathBuf> {
        self.log.lock().await.writer.as_ref().map(|w| w.path().to_path_buf())
    }

    pub async fn settlement_ref(&self, seq: u64) -> Option<String> {
        self.log.lock().await.refs.get(&seq).cloned()
    }

    pub async fn grant_info(&self, delegate: Address) -> Option<(Grant, DailyUsage)> {
        let cell = self.cell(delegate);
        let cell = cell.lock().await;
        cell.grant.clone().map(|g| (g, cell.usage))
    }

    /// Remaining allowance in the current window; the engine's view, on
    /// authoritative state.
    pub async fn available(&self, delegate: Address, now: u64) -> Result<Amount, NodeError> {
        let cell = self.cell(delegate);
        let cell = cell.lock().await;
        match &cell.grant {
            Some(g) if g.active => Ok(engine::available(g, &cell.usage, now)),
            _ => Err(NodeError::Denied(DenyReason::NoSuchDelegation)),
        }
    }

    /// History from `from_seq` plus a live receiver. Events emitted between
    /// the two may appear in both; consumers dedup by checkpoint.
    pub async fn subscribe(&self, from_seq: u64) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        let rx = self.events_tx.subscribe();
        let log = self.log.lock().await;
        let history = log.entries.iter().filter(|ev| ev.seq >= from_seq).cloned().collect();
        (history, rx)
    }
}

/// Stable request id: hash of the command plus its ledger position, so a
/// replayed log reproduces the same ids.
fn derive_request_id(delegate: Address, asset: Address, to: Address, amount: Amount, seq: u64) -> RequestId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(delegate.as_bytes());
    hasher.update(asset.as_bytes());
    hasher.update(to.as_bytes());
    hasher.update(&amount.to_le_bytes());
    hasher.update(&seq.to_le_bytes());
    RequestId(*hasher.finalize().as_bytes())
}

/// Deterministic stand-in for the settlement layer's transaction reference.
fn derive_settlement_ref(seq: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"settle");
    hasher.update(&seq.to_le_bytes());
    format!("0x{}", hasher.finalize().to_hex())
}
