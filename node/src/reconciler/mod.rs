// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event Reconciler: drives the ledger event stream into the mirror store.
//!
//! The stream is ordered end-to-end but delivered at least once, and the
//! reconciler tolerates bounded reordering around its durable checkpoint.
//!
//! # Invariants
//! - An event at or below the checkpoint is never re-applied.
//! - A `SpendCommitted`/`SpendDenied` that references a request the mirror
//!   has not seen yet is deferred, not dropped; past the deferral window it
//!   is applied anyway and the mirror records the unmatched outcome.
//! - Transient store failures retry with exponential backoff; events that
//!   exhaust retries (or are rejected outright) are parked with their error
//!   and the stream continues.
//! - The checkpoint advances only after an event is applied or parked, and
//!   never past an outstanding deferral: the still-missing prerequisite
//!   sits at an unknown lower position that redelivery must be able to
//!   reach. Parked events do not hold the checkpoint back.
//! - Deferred and parked events persist alongside the checkpoint and are
//!   restored on restart; a crash never strands an event the stream will
//!   not redeliver below the checkpoint.

pub mod checkpoint;

pub use checkpoint::Checkpoint;

use crate::config::{NodeConfig, RetryConfig};
use crate::ledger::LedgerClient;
use crate::mirror::{MirrorError, MirrorWriter};
use pocket_kernel::event::{LedgerEvent, SequencedEvent};
use pocket_kernel::types::RequestId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_stream::StreamExt;

struct Deferred {
    ev: SequencedEvent,
    expires_at: Instant,
}

/// An event the reconciler gave up on. The event itself is kept, for
/// operator inspection and manual replay; the stream does not stop for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parked {
    pub seq: u64,
    pub error: String,
    pub event: SequencedEvent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerStatus {
    pub last_seq: u64,
    pub deferred: usize,
    pub parked: Vec<Parked>,
}

pub struct Reconciler<S: MirrorWriter> {
    store: Arc<S>,
    last_seq: u64,
    checkpoint_path: Option<PathBuf>,
    retry: RetryConfig,
    defer_window: Duration,
    deferred: Vec<Deferred>,
    parked: Vec<Parked>,
}

impl<S: MirrorWriter> Reconciler<S> {
    pub fn new(store: Arc<S>, config: &NodeConfig) -> Self {
        let checkpoint = match &config.checkpoint_path {
            Some(path) => match Checkpoint::load(path) {
                Ok(cp) => cp,
                Err(e) => {
                    tracing::error!("Checkpoint load failed ({}); starting from zero", e);
                    Checkpoint::default()
                }
            },
            None => Checkpoint::default(),
        };
        if checkpoint.last_seq > 0 {
            tracing::info!("Reconciler resuming after ledger position {}", checkpoint.last_seq);
        }
        if !checkpoint.deferred.is_empty() || !checkpoint.parked.is_empty() {
            tracing::info!(
                "Restored {} deferred and {} parked events from the checkpoint",
                checkpoint.deferred.len(),
                checkpoint.parked.len()
            );
        }
        let defer_window = Duration::from_secs(config.defer_window_secs);
        // Restored deferrals get a fresh window rather than a persisted
        // deadline; at worst the unmatched fallback is delayed by one window.
        let deferred = checkpoint
            .deferred
            .into_iter()
            .map(|ev| Deferred {
                ev,
                expires_at: Instant::now() + defer_window,
            })
            .collect();
        Self {
            store,
            last_seq: checkpoint.last_seq,
            checkpoint_path: config.checkpoint_path.clone(),
            retry: config.retry,
            defer_window,
            deferred,
            parked: checkpoint.parked,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn status(&self) -> ReconcilerStatus {
        ReconcilerStatus {
            last_seq: self.last_seq,
            deferred: self.deferred.len(),
            parked: self.parked.clone(),
        }
    }

    /// Re-drive a parked event, typically after the store fault behind it
    /// was repaired. Returns false when no event is parked at `seq`.
    pub async fn replay_parked(&mut self, seq: u64) -> bool {
        match self.parked.iter().position(|p| p.seq == seq) {
            Some(i) => {
                let parked = self.parked.swap_remove(i);
                tracing::info!("Replaying parked event at seq {}", seq);
                self.apply_with_retry(parked.event).await;
                true
            }
            None => false,
        }
    }

    /// Ingest one event from the stream.
    pub async fn handle(&mut self, ev: SequencedEvent) {
        if ev.seq <= self.last_seq && !self.is_deferred(ev.seq) {
            metrics::increment_counter!("pocket_events_duplicate_total");
            tracing::debug!("Skipping redelivered event at seq {}", ev.seq);
            return;
        }

        if let Some(id) = self.missing_prerequisite(&ev) {
            if !self.is_deferred(ev.seq) {
                metrics::increment_counter!("pocket_events_deferred_total");
                tracing::info!(
                    "Deferring event at seq {} awaiting request {} to appear",
                    ev.seq,
                    id
                );
                let expires_at = Instant::now() + self.defer_window;
                self.deferred.push(Deferred { ev, expires_at });
                // The checkpoint stays below the deferral so its missing
                // prerequisite is still reachable by redelivery; the
                // persisted copy keeps the deferral itself crash-safe.
                self.persist_checkpoint();
            }
            return;
        }

        // A redelivery may unblock its own deferred copy.
        self.deferred.retain(|d| d.ev.seq != ev.seq);
        self.apply_with_retry(ev).await;
        self.drain_deferred().await;
    }

    /// Periodic housekeeping: re-drive deferred events whose prerequisite
    /// arrived, and force-apply those past their window.
    pub async fn tick(&mut self) {
        self.drain_deferred().await;

        let now = Instant::now();
        let expired: Vec<SequencedEvent> = {
            let mut out = Vec::new();
            let mut i = 0;
            while i < self.deferred.len() {
                if self.deferred[i].expires_at <= now {
                    out.push(self.deferred.swap_remove(i).ev);
                } else {
                    i += 1;
                }
            }
            out
        };
        for ev in expired {
            tracing::warn!(
                "Deferred event at seq {} expired unmatched; applying as-is",
                ev.seq
            );
            self.apply_with_retry(ev).await;
        }
    }

    fn is_deferred(&self, seq: u64) -> bool {
        self.deferred.iter().any(|d| d.ev.seq == seq)
    }

    /// A resolution event whose request row has not landed yet.
    fn missing_prerequisite(&self, ev: &SequencedEvent) -> Option<RequestId> {
        let id = match &ev.event {
            LedgerEvent::SpendCommitted {
                request_id: Some(id), ..
            } => *id,
            LedgerEvent::SpendDenied { request_id, .. } => *request_id,
            _ => return None,
        };
        if self.store.has_request(&id) {
            None
        } else {
            Some(id)
        }
    }

    /// Apply deferred events whose prerequisite is now present, repeating
    /// until a pass makes no progress.
    async fn drain_deferred(&mut self) {
        loop {
            let ready = self
                .deferred
                .iter()
                .position(|d| self.missing_prerequisite(&d.ev).is_none());
            match ready {
                Some(i) => {
                    let ev = self.deferred.swap_remove(i).ev;
                    tracing::info!("Deferred event at seq {} unblocked", ev.seq);
                    self.apply_with_retry(ev).await;
                }
                None => break,
            }
        }
    }

    async fn apply_with_retry(&mut self, ev: SequencedEvent) {
        let seq = ev.seq;
        let mut attempt: u32 = 0;
        loop {
            match self.store.apply(&ev) {
                Ok(()) => {
                    metrics::increment_counter!("pocket_events_applied_total");
                    break;
                }
                Err(MirrorError::Rejected(msg)) => {
                    tracing::error!("Mirror rejected event at seq {}: {}", seq, msg);
                    metrics::increment_counter!("pocket_events_parked_total");
                    self.parked.push(Parked {
                        seq,
                        error: msg,
                        event: ev,
                    });
                    break;
                }
                Err(MirrorError::Unavailable(msg)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            "Mirror unavailable for event at seq {} after {} attempts: {}",
                            seq,
                            attempt,
                            msg
                        );
                        metrics::increment_counter!("pocket_events_parked_total");
                        self.parked.push(Parked {
                            seq,
                            error: msg,
                            event: ev,
                        });
                        break;
                    }
                    metrics::increment_counter!("pocket_store_retry_total");
                    let delay = self
                        .retry
                        .base_delay_ms
                        .saturating_mul(1u64 << attempt.min(16))
                        .min(self.retry.max_delay_ms);
                    tracing::warn!(
                        "Mirror write failed at seq {} (attempt {}): {}; retrying in {}ms",
                        seq,
                        attempt,
                        msg,
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        // Advance up to this event, but not past an outstanding deferral:
        // events between the checkpoint and the deferral (its prerequisite
        // among them) must stay redeliverable.
        let cap = self
            .deferred
            .iter()
            .map(|d| d.ev.seq.saturating_sub(1))
            .min()
            .unwrap_or(u64::MAX);
        let target = seq.min(cap);
        if target > self.last_seq {
            self.last_seq = target;
        }
        // Persist even when the position did not move: a drained deferral or
        // a fresh parking changed the outstanding set.
        self.persist_checkpoint();
        metrics::gauge!("pocket_reconciler_checkpoint", self.last_seq as f64);
    }

    fn persist_checkpoint(&self) {
        if let Some(path) = &self.checkpoint_path {
            let checkpoint = Checkpoint {
                last_seq: self.last_seq,
                deferred: self.deferred.iter().map(|d| d.ev.clone()).collect(),
                parked: self.parked.clone(),
            };
            if let Err(e) = checkpoint.save(path) {
                // Worst case on crash: re-ingest from an older position,
                // which the idempotent mirror absorbs.
                tracing::error!("Checkpoint save failed: {}", e);
            }
        }
    }
}

/// Feed an in-process subscription into the reconciler, with a housekeeping
/// interval for deferred events.
pub async fn run<S: MirrorWriter + 'static>(
    reconciler: Arc<Mutex<Reconciler<S>>>,
    history: Vec<SequencedEvent>,
    mut live_rx: broadcast::Receiver<SequencedEvent>,
    tick_ms: u64,
) {
    {
        let mut rec = reconciler.lock().await;
        for ev in history {
            rec.handle(ev).await;
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(10)));
    loop {
        tokio::select! {
            item = live_rx.recv() => match item {
                Ok(ev) => reconciler.lock().await.handle(ev).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missed events are still in the log; the caller is
                    // expected to re-subscribe from the checkpoint.
                    tracing::warn!("Reconciler lagged behind the live stream by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Ledger stream closed; reconciler stopping");
                    return;
                }
            },
            _ = ticker.tick() => reconciler.lock().await.tick().await,
        }
    }
}

/// Follow a remote node's NDJSON event stream instead of an in-process
/// ledger. Reconnects from the checkpoint on any stream failure; lines that
/// fail to parse are counted and skipped, never retried.
pub async fn run_stream<S: MirrorWriter + 'static>(
    reconciler: Arc<Mutex<Reconciler<S>>>,
    client: LedgerClient,
    tick_ms: u64,
) {
    loop {
        let start_seq = reconciler.lock().await.last_seq() + 1;
        tracing::info!(
            "Follower: connecting to {} from seq {}",
            client.base_url(),
            start_seq
        );

        match client.stream_events(start_seq).await {
            Ok(resp) => {
                let mut stream = resp.bytes_stream();
                let mut buffer = String::new();

                loop {
                    match tokio::time::timeout(Duration::from_millis(tick_ms.max(10)), stream.next()).await {
                        Ok(Some(Ok(chunk))) => {
                            buffer.push_str(&String::from_utf8_lossy(&chunk));
                            while let Some(idx) = buffer.find('\n') {
                                let line = buffer.drain(..=idx).collect::<String>();
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<SequencedEvent>(line) {
                                    Ok(ev) => reconciler.lock().await.handle(ev).await,
                                    Err(e) => {
                                        metrics::increment_counter!("pocket_events_poison_total");
                                        tracing::warn!("Skipping unparseable stream line: {}", e);
                                    }
                                }
                            }
                        }
                        Ok(Some(Err(e))) => {
                            tracing::warn!("Follower: stream error: {}", e);
                            break;
                        }
                        Ok(None) => {
                            tracing::warn!("Follower: stream ended; reconnecting");
                            break;
                        }
                        Err(_) => {
                            // Idle: housekeeping for deferred events.
                            reconciler.lock().await.tick().await;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Follower: connect failed: {}", e),
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
