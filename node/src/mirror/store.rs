// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-process mirror tables.
//!
//! Four logical tables (Grant, DailyUsage, SpendRequest, Transfer) behind
//! one `RwLock`, with JSON snapshot/restore for restart. Stands in for the
//! transactional relational store the deployment assumes; the apply
//! operations here are the store-agnostic upsert rules.

use super::{GrantRow, MirrorError, MirrorWriter, RequestStatus, SpendRequestRow, TransferRow};
use pocket_kernel::event::{LedgerEvent, SequencedEvent};
use pocket_kernel::grant::Grant;
use pocket_kernel::types::{Address, Amount, RequestId};
use pocket_kernel::usage::DailyUsage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Default, Serialize, Deserialize)]
struct Tables {
    grants: HashMap<Address, GrantRow>,
    usage: HashMap<Address, DailyUsage>,
    requests: HashMap<RequestId, SpendRequestRow>,
    transfers: BTreeMap<u64, TransferRow>,
    /// Uniqueness guard for settlement references.
    settlement_refs: HashSet<String>,
    /// Fills that arrived before their row did; consumed on apply.
    #[serde(default)]
    pending_request_refs: HashMap<RequestId, String>,
    #[serde(default)]
    pending_transfer_refs: HashMap<u64, String>,
}

pub struct MirrorStore {
    owner: Address,
    tables: RwLock<Tables>,
}

impl MirrorWriter for MirrorStore {
    fn apply(&self, ev: &SequencedEvent) -> Result<(), MirrorError> {
        match &ev.event {
            LedgerEvent::GrantSet {
                delegate,
                requires_approval,
                daily_limit,
                name,
            } => self.apply_grant_set(ev.seq, *delegate, *requires_approval, *daily_limit, name),
            LedgerEvent::GrantRevoked { delegate } => self.apply_grant_revoked(ev.seq, *delegate),
            LedgerEvent::SpendQueued {
                request_id,
                delegate,
                asset,
                to,
                amount,
                description,
            } => self.apply_spend_queued(
                ev.seq,
                ev.timestamp,
                *request_id,
                *delegate,
                *asset,
                *to,
                *amount,
                description,
            ),
            LedgerEvent::SpendCommitted {
                request_id,
                actor,
                asset,
                to,
                amount,
            } => self.apply_spend_committed(ev.seq, ev.timestamp, *request_id, *actor, *asset, *to, *amount),
            LedgerEvent::SpendDenied {
                request_id,
                delegate,
                reason,
            } => self.apply_spend_denied(ev.timestamp, *request_id, *delegate, reason),
        }
    }

    fn has_request(&self, id: &RequestId) -> bool {
        let guard = self.read();
        guard.requests.contains_key(id)
    }
}

impl MirrorStore {
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        // A poisoned lock means a writer panicked mid-update; the tables
        // are plain data, so the projection is still usable.
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }

    // --- Event application (idempotent upserts) ---

    /// Upsert keyed by delegate; terms replace in place. Ordered by ledger
    /// position: an older `GrantSet` arriving late never clobbers newer terms.
    fn apply_grant_set(
        &self,
        seq: u64,
        delegate: Address,
        requires_approval: bool,
        daily_limit: Amount,
        name: &str,
    ) -> Result<(), MirrorError> {
        let mut guard = self.write();
        match guard.grants.get_mut(&delegate) {
            Some(row) => {
                if row.updated_seq >= seq {
                    tracing::debug!("GrantSet seq {} stale for {} (have {})", seq, delegate, row.updated_seq);
                    return Ok(());
                }
                row.grant.set_terms(requires_approval, daily_limit, name);
                row.updated_seq = seq;
            }
            None => {
                guard.grants.insert(
                    delegate,
                    GrantRow {
                        grant: Grant::new(self.owner, delegate, requires_approval, daily_limit, name),
                        updated_seq: seq,
                    },
                );
                // Usage is created lazily with the grant.
                guard.usage.entry(delegate).or_default();
            }
        }
        Ok(())
    }

    fn apply_grant_revoked(&self, seq: u64, delegate: Address) -> Result<(), MirrorError> {
        let mut guard = self.write();
        match guard.grants.get_mut(&delegate) {
            Some(row) if row.updated_seq >= seq => Ok(()),
            Some(row) => {
                row.grant.revoke();
                row.updated_seq = seq;
                Ok(())
            }
            None => {
                // Revocation observed before any GrantSet. Nothing to mark;
                // redelivery of the set event will carry a lower seq and be
                // equally ignorable only if it precedes this one, so log it.
                tracing::warn!("GrantRevoked for unknown delegate {} at seq {}", delegate, seq);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_spend_queued(
        &self,
        seq: u64,
        timestamp: u64,
        request_id: RequestId,
        delegate: Address,
        asset: Address,
        to: Address,
        amount: Amount,
        description: &str,
    ) -> Result<(), MirrorError> {
        let mut guard = self.write();
        if let Some(existing) = guard.requests.get(&request_id) {
            let identical = existing.delegate == delegate
                && existing.asset == asset
                && existing.to == to
                && existing.amount == amount;
            if !identical {
                tracing::warn!(
                    "SpendQueued redelivery for {} disagrees with stored row; keeping existing",
                    request_id
                );
            }
            return Ok(());
        }

        // The commit may have been applied first (unmatched fallback). If a
        // transfer already references this id, the request is born resolved.
        let resolved = guard
            .transfers
            .values()
            .find(|t| t.request_id == Some(request_id))
            .map(|t| (t.settlement_ref.clone(), t.timestamp));

        let (status, settlement_ref, resolved_at) = match resolved {
            Some((sref, ts)) => (RequestStatus::Approved, sref, Some(ts)),
            None => (RequestStatus::Pending, None, None),
        };
        let settlement_ref = settlement_ref.or_else(|| guard.pending_request_refs.remove(&request_id));
        if let Some(sref) = &settlement_ref {
            guard.settlement_refs.insert(sref.clone());
        }

        guard.requests.insert(
            request_id,
            SpendRequestRow {
                request_id,
                delegate,
                asset,
                to,
                amount,
                description: description.to_string(),
                status,
                deny_reason: None,
                settlement_ref,
                created_seq: seq,
                created_at: timestamp,
                resolved_at,
            },
        );
        Ok(())
    }

    fn apply_spend_committed(
        &self,
        seq: u64,
        timestamp: u64,
        request_id: Option<RequestId>,
        actor: Address,
        asset: Address,
        to: Address,
        amount: Amount,
    ) -> Result<(), MirrorError> {
        let mut guard = self.write();
        if guard.transfers.contains_key(&seq) {
            // Redelivery: the transfer is keyed by ledger position.
            return Ok(());
        }

        // Prefer a fill stashed against the request, then one against this
        // ledger position.
        let mut settlement_ref = None;
        if let Some(id) = request_id {
            settlement_ref = guard.pending_request_refs.remove(&id);
            match guard.requests.get_mut(&id) {
                Some(row) if row.status == RequestStatus::Pending => {
                    row.status = RequestStatus::Approved;
                    row.resolved_at = Some(timestamp);
                    if row.settlement_ref.is_none() {
                        row.settlement_ref = settlement_ref.clone();
                    } else {
                        settlement_ref = row.settlement_ref.clone();
                    }
                }
                Some(row) if row.status == RequestStatus::Rejected => {
                    // Terminal states are final; a commit against a rejected
                    // request is a ledger anomaly, not a transition.
                    tracing::warn!("SpendCommitted at seq {} targets rejected request {}", seq, id);
                }
                Some(row) => {
                    // Already approved: redelivery. Reuse its reference.
                    settlement_ref = row.settlement_ref.clone();
                }
                None => {
                    tracing::warn!("SpendCommitted at seq {} has no known request {}", seq, id);
                }
            }
        }
        if settlement_ref.is_none() {
            settlement_ref = guard.pending_transfer_refs.remove(&seq);
        }
        if let Some(sref) = &settlement_ref {
            guard.settlement_refs.insert(sref.clone());
        }

        guard.transfers.insert(
            seq,
            TransferRow {
                seq,
                actor,
                asset,
                to,
                amount,
                request_id,
                settlement_ref,
                timestamp,
            },
        );

        // Project the rolling counter with the ledger's clock, not ours.
        let usage = guard.usage.entry(actor).or_default();
        let mut eff = usage.effective_at(timestamp);
        eff.spent = eff.spent.saturating_add(amount);
        *usage = eff;

        Ok(())
    }

    fn apply_spend_denied(
        &self,
        timestamp: u64,
        request_id: RequestId,
        delegate: Address,
        reason: &str,
    ) -> Result<(), MirrorError> {
        let mut guard = self.write();
        match guard.requests.get_mut(&request_id) {
            Some(row) if row.status == RequestStatus::Pending => {
                row.status = RequestStatus::Rejected;
                row.deny_reason = Some(reason.to_string());
                row.resolved_at = Some(timestamp);
            }
            Some(_) => {} // terminal already: redelivery, no-op
            None => {
                tracing::warn!("SpendDenied for unknown request {} (delegate {})", request_id, delegate);
            }
        }
        Ok(())
    }

    // --- Settlement reference fill-in ---

    /// Update-if-placeholder: a confirmed reference is never overwritten and
    /// never reused by another row. Fills the request row and its transfer.
    pub fn fill_settlement_ref(&self, request_id: RequestId, settlement_ref: &str) {
        let mut guard = self.write();
        if guard.settlement_refs.contains(settlement_ref) {
            let owned_here = guard
                .requests
                .get(&request_id)
                .map(|r| r.settlement_ref.as_deref() == Some(settlement_ref))
                .unwrap_or(false);
            if !owned_here {
                tracing::warn!("Settlement ref collision on {}; existing record wins", settlement_ref);
                return;
            }
        }
        let Some(row) = guard.requests.get_mut(&request_id) else {
            // The resolution event has not been mirrored yet; stash the
            // fill and let apply() consume it.
            guard
                .pending_request_refs
                .insert(request_id, settlement_ref.to_string());
            return;
        };
        match &row.settlement_ref {
            None => row.settlement_ref = Some(settlement_ref.to_string()),
            Some(existing) if existing == settlement_ref => {} // idempotent
            Some(existing) => {
                tracing::warn!(
                    "Refusing to overwrite settlement ref {} with {} on {}",
                    existing,
                    settlement_ref,
                    request_id
                );
                return;
            }
        }
        guard.settlement_refs.insert(settlement_ref.to_string());
        if let Some(t) = guard.transfers.values_mut().find(|t| t.request_id == Some(request_id)) {
            if t.settlement_ref.is_none() {
                t.settlement_ref = Some(settlement_ref.to_string());
            }
        }
    }

    /// Same rule keyed by ledger position, for direct (unrequested) commits.
    pub fn fill_transfer_ref(&self, seq: u64, settlement_ref: &str) {
        let mut guard = self.write();
        if guard.settlement_refs.contains(settlement_ref) {
            let owned_here = guard
                .transfers
                .get(&seq)
                .map(|t| t.settlement_ref.as_deref() == Some(settlement_ref))
                .unwrap_or(false);
            if !owned_here {
                tracing::warn!("Settlement ref collision on {}; existing record wins", settlement_ref);
                return;
            }
        }
        let Some(t) = guard.transfers.get_mut(&seq) else {
            guard.pending_transfer_refs.insert(seq, settlement_ref.to_string());
            return;
        };
        match &t.settlement_ref {
            None => t.settlement_ref = Some(settlement_ref.to_string()),
            Some(existing) if existing == settlement_ref => {}
            Some(_) => return,
        }
        let request_id = t.request_id;
        guard.settlement_refs.insert(settlement_ref.to_string());
        if let Some(id) = request_id {
            if let Some(r) = guard.requests.get_mut(&id) {
                if r.settlement_ref.is_none() {
                    r.settlement_ref = Some(settlement_ref.to_string());
                }
            }
        }
    }

    // --- Read surface ---

    pub fn list_grants(&self, owner: Option<Address>) -> Vec<GrantRow> {
        let guard = self.read();
        let mut rows: Vec<GrantRow> = guard
            .grants
            .values()
            .filter(|row| owner.map(|o| row.grant.owner == o).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.grant.delegate);
        rows
    }

    pub fn get_grant(&self, delegate: &Address) -> Option<GrantRow> {
        self.read().grants.get(delegate).cloned()
    }

    pub fn usage(&self, delegate: &Address) -> Option<DailyUsage> {
        self.read().usage.get(delegate).copied()
    }

    pub fn get_request(&self, request_id: &RequestId) -> Option<SpendRequestRow> {
        self.read().requests.get(request_id).cloned()
    }

    /// Pending requests, newest first.
    pub fn list_pending_requests(&self) -> Vec<SpendRequestRow> {
        let guard = self.read();
        let mut rows: Vec<SpendRequestRow> = guard
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_seq.cmp(&a.created_seq));
        rows
    }

    /// Transfers, newest first, optionally scoped to one delegate.
    pub fn list_transfers(&self, delegate: Option<Address>) -> Vec<TransferRow> {
        let guard = self.read();
        guard
            .transfers
            .values()
            .rev()
            .filter(|t| delegate.map(|d| t.actor == d).unwrap_or(true))
            .cloned()
            .collect()
    }

    // --- Persistence ---

    pub fn snapshot(&self) -> Vec<u8> {
        let guard = self.read();
        serde_json::to_vec(&*guard).unwrap_or_default()
    }

    pub fn restore(&self, data: &[u8]) {
        match serde_json::from_slice::<Tables>(data) {
            Ok(tables) => {
                let mut guard = self.write();
                *guard = tables;
            }
            Err(e) => tracing::error!("Mirror snapshot restore failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn rid(b: u8) -> RequestId {
        RequestId([b; 32])
    }

    fn store() -> MirrorStore {
        MirrorStore::new(addr(0xaa))
    }

    fn grant_set(seq: u64, delegate: Address, limit: Amount) -> SequencedEvent {
        SequencedEvent {
            seq,
            timestamp: T0,
            event: LedgerEvent::GrantSet {
                delegate,
                requires_approval: false,
                daily_limit: limit,
                name: "Kid".into(),
            },
        }
    }

    #[test]
    fn test_grant_set_upserts_in_place() {
        let s = store();
        s.apply(&grant_set(1, addr(1), 10)).unwrap();
        s.apply(&grant_set(3, addr(1), 25)).unwrap();

        let rows = s.list_grants(None);
        assert_eq!(rows.len(), 1, "republish must not create a duplicate row");
        assert_eq!(rows[0].grant.daily_limit, 25);

        // Late redelivery of the older version loses by ledger order.
        s.apply(&grant_set(2, addr(1), 99)).unwrap();
        assert_eq!(s.get_grant(&addr(1)).unwrap().grant.daily_limit, 25);
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let s = store();
        s.apply(&grant_set(1, addr(1), 10)).unwrap();
        let revoke = SequencedEvent {
            seq: 2,
            timestamp: T0,
            event: LedgerEvent::GrantRevoked { delegate: addr(1) },
        };
        s.apply(&revoke).unwrap();
        s.apply(&revoke).unwrap();
        assert!(!s.get_grant(&addr(1)).unwrap().grant.active);
    }

    #[test]
    fn test_committed_applied_twice_single_transfer() {
        let s = store();
        let ev = SequencedEvent {
            seq: 5,
            timestamp: T0,
            event: LedgerEvent::SpendCommitted {
                request_id: None,
                actor: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 40,
            },
        };
        s.apply(&ev).unwrap();
        s.apply(&ev).unwrap();

        assert_eq!(s.list_transfers(None).len(), 1);
        // Usage projected once, not twice.
        assert_eq!(s.usage(&addr(1)).unwrap().spent, 40);
    }

    #[test]
    fn test_terminal_request_never_transitions_again() {
        let s = store();
        s.apply(&SequencedEvent {
            seq: 1,
            timestamp: T0,
            event: LedgerEvent::SpendQueued {
                request_id: rid(9),
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
                description: "snacks".into(),
            },
        })
        .unwrap();
        s.apply(&SequencedEvent {
            seq: 2,
            timestamp: T0 + 10,
            event: LedgerEvent::SpendDenied {
                request_id: rid(9),
                delegate: addr(1),
                reason: "not today".into(),
            },
        })
        .unwrap();

        // A late commit against the rejected request must not flip it.
        s.apply(&SequencedEvent {
            seq: 3,
            timestamp: T0 + 20,
            event: LedgerEvent::SpendCommitted {
                request_id: Some(rid(9)),
                actor: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
            },
        })
        .unwrap();

        let row = s.get_request(&rid(9)).unwrap();
        assert_eq!(row.status, RequestStatus::Rejected);
        assert_eq!(row.deny_reason.as_deref(), Some("not today"));
    }

    #[test]
    fn test_queued_after_commit_pairs_up() {
        // Ordering tolerance: the commit was applied first via the fallback
        // path; the late SpendQueued must not resurrect a pending request.
        let s = store();
        s.apply(&SequencedEvent {
            seq: 7,
            timestamp: T0,
            event: LedgerEvent::SpendCommitted {
                request_id: Some(rid(4)),
                actor: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
            },
        })
        .unwrap();
        s.apply(&SequencedEvent {
            seq: 6,
            timestamp: T0 - 5,
            event: LedgerEvent::SpendQueued {
                request_id: rid(4),
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
                description: String::new(),
            },
        })
        .unwrap();

        let row = s.get_request(&rid(4)).unwrap();
        assert_eq!(row.status, RequestStatus::Approved);
        assert!(s.list_pending_requests().is_empty());
    }

    #[test]
    fn test_settlement_fill_is_update_if_unset() {
        let s = store();
        s.apply(&SequencedEvent {
            seq: 1,
            timestamp: T0,
            event: LedgerEvent::SpendQueued {
                request_id: rid(1),
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
                description: String::new(),
            },
        })
        .unwrap();
        s.apply(&SequencedEvent {
            seq: 2,
            timestamp: T0,
            event: LedgerEvent::SpendCommitted {
                request_id: Some(rid(1)),
                actor: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
            },
        })
        .unwrap();

        s.fill_settlement_ref(rid(1), "0xdeadbeef");
        s.fill_settlement_ref(rid(1), "0xdeadbeef"); // idempotent
        s.fill_settlement_ref(rid(1), "0xother"); // refused

        let row = s.get_request(&rid(1)).unwrap();
        assert_eq!(row.settlement_ref.as_deref(), Some("0xdeadbeef"));
        let transfer = &s.list_transfers(None)[0];
        assert_eq!(transfer.settlement_ref.as_deref(), Some("0xdeadbeef"));
    }

    #[test]
    fn test_fill_before_apply_is_stashed() {
        // The command path learns the settlement ref before the reconciler
        // has mirrored the event; the fill must survive the gap.
        let s = store();
        s.fill_settlement_ref(rid(2), "0xfeed");

        s.apply(&SequencedEvent {
            seq: 1,
            timestamp: T0,
            event: LedgerEvent::SpendQueued {
                request_id: rid(2),
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 5,
                description: String::new(),
            },
        })
        .unwrap();

        assert_eq!(s.get_request(&rid(2)).unwrap().settlement_ref.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let s = store();
        s.apply(&grant_set(1, addr(1), 10)).unwrap();
        s.apply(&SequencedEvent {
            seq: 2,
            timestamp: T0,
            event: LedgerEvent::SpendCommitted {
                request_id: None,
                actor: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 4,
            },
        })
        .unwrap();

        let snap = s.snapshot();
        let restored = MirrorStore::new(addr(0xaa));
        restored.restore(&snap);

        assert_eq!(restored.list_grants(None).len(), 1);
        assert_eq!(restored.usage(&addr(1)).unwrap().spent, 4);
        assert_eq!(restored.list_transfers(None).len(), 1);
    }
}
