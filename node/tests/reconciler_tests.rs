use pocket_kernel::event::{LedgerEvent, SequencedEvent};
use pocket_kernel::types::{Address, RequestId};
use pocket_node::config::NodeConfig;
use pocket_node::mirror::{MirrorError, MirrorStore, MirrorWriter, RequestStatus};
use pocket_node::reconciler::Reconciler;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const T0: u64 = 1_700_000_000;

fn addr(b: u8) -> Address {
    Address([b; 20])
}

fn rid(b: u8) -> RequestId {
    RequestId([b; 32])
}

fn grant_set(seq: u64) -> SequencedEvent {
    SequencedEvent {
        seq,
        timestamp: T0,
        event: LedgerEvent::GrantSet {
            delegate: addr(1),
            requires_approval: true,
            daily_limit: 100,
            name: "Kid".into(),
        },
    }
}

fn queued(seq: u64, id: RequestId) -> SequencedEvent {
    SequencedEvent {
        seq,
        timestamp: T0,
        event: LedgerEvent::SpendQueued {
            request_id: id,
            delegate: addr(1),
            asset: addr(2),
            to: addr(3),
            amount: 10,
            description: String::new(),
        },
    }
}

fn committed(seq: u64, id: Option<RequestId>) -> SequencedEvent {
    SequencedEvent {
        seq,
        timestamp: T0,
        event: LedgerEvent::SpendCommitted {
            request_id: id,
            actor: addr(1),
            asset: addr(2),
            to: addr(3),
            amount: 10,
        },
    }
}

fn fast_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.retry.base_delay_ms = 1;
    cfg.retry.max_delay_ms = 5;
    cfg
}

#[tokio::test]
async fn test_redelivered_event_applied_once() {
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut rec = Reconciler::new(Arc::clone(&store), &fast_config());

    rec.handle(grant_set(1)).await;
    rec.handle(committed(2, None)).await;
    rec.handle(committed(2, None)).await; // redelivery
    rec.handle(grant_set(1)).await; // redelivery

    assert_eq!(store.list_transfers(None).len(), 1);
    assert_eq!(store.usage(&addr(1)).unwrap().spent, 10);
    assert_eq!(rec.last_seq(), 2);
}

#[tokio::test]
async fn test_commit_before_queue_defers_then_pairs() {
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut rec = Reconciler::new(Arc::clone(&store), &fast_config());

    rec.handle(grant_set(1)).await;
    // Resolution arrives before the request it resolves.
    rec.handle(committed(3, Some(rid(7)))).await;
    assert!(store.list_transfers(None).is_empty(), "commit must wait for its request");
    assert_eq!(rec.status().deferred, 1);

    rec.handle(queued(2, rid(7))).await;
    assert_eq!(rec.status().deferred, 0);
    assert_eq!(store.get_request(&rid(7)).unwrap().status, RequestStatus::Approved);
    assert_eq!(store.list_transfers(None).len(), 1);
}

#[tokio::test]
async fn test_expired_deferral_applies_unmatched() {
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut cfg = fast_config();
    cfg.defer_window_secs = 0;
    let mut rec = Reconciler::new(Arc::clone(&store), &cfg);

    rec.handle(committed(1, Some(rid(9)))).await;
    assert_eq!(rec.status().deferred, 1);

    // The queue event never shows up; past the window the transfer is
    // recorded anyway.
    rec.tick().await;
    assert_eq!(rec.status().deferred, 0);
    assert_eq!(store.list_transfers(None).len(), 1);
    assert!(store.get_request(&rid(9)).is_none());
}

#[tokio::test]
async fn test_checkpoint_survives_restart() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut cfg = fast_config();
    cfg.checkpoint_path = Some(dir.path().join("checkpoint.json"));

    {
        let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
        rec.handle(grant_set(1)).await;
        rec.handle(committed(2, None)).await;
        assert_eq!(rec.last_seq(), 2);
    }

    // Fresh reconciler, same checkpoint file: old events are duplicates.
    let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
    assert_eq!(rec.last_seq(), 2);
    rec.handle(committed(2, None)).await;
    assert_eq!(store.list_transfers(None).len(), 1);
}

#[tokio::test]
async fn test_deferred_event_survives_restart() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut cfg = fast_config();
    cfg.checkpoint_path = Some(dir.path().join("checkpoint.json"));
    cfg.defer_window_secs = 0;

    {
        let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
        rec.handle(committed(1, Some(rid(7)))).await;
        assert_eq!(rec.status().deferred, 1);
        // The checkpoint holds below the outstanding deferral.
        assert_eq!(rec.last_seq(), 0);
    } // crash before the prerequisite ever arrives

    let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
    assert_eq!(rec.status().deferred, 1, "deferral must survive the restart");

    // Redelivery of the deferred seq does not double it up.
    rec.handle(committed(1, Some(rid(7)))).await;
    assert_eq!(rec.status().deferred, 1);

    rec.tick().await;
    assert_eq!(rec.status().deferred, 0);
    assert_eq!(store.list_transfers(None).len(), 1, "the transfer must not be lost");
    assert_eq!(rec.last_seq(), 1);
}

#[tokio::test]
async fn test_deferred_event_pairs_after_restart() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MirrorStore::new(addr(0xaa)));
    let mut cfg = fast_config();
    cfg.checkpoint_path = Some(dir.path().join("checkpoint.json"));

    {
        let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
        rec.handle(grant_set(1)).await;
        rec.handle(committed(3, Some(rid(7)))).await;
    }

    // The late queue event arrives after the restart and unblocks the
    // restored deferral.
    let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
    rec.handle(queued(2, rid(7))).await;

    assert_eq!(rec.status().deferred, 0);
    assert_eq!(store.get_request(&rid(7)).unwrap().status, RequestStatus::Approved);
    assert_eq!(store.list_transfers(None).len(), 1);
}

/// Fault-injecting store: fails the first `fail_count` applies.
struct FlakyStore {
    inner: MirrorStore,
    remaining_failures: AtomicU32,
    permanent: bool,
}

impl MirrorWriter for FlakyStore {
    fn apply(&self, ev: &SequencedEvent) -> Result<(), MirrorError> {
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            if self.permanent {
                return Err(MirrorError::Rejected("schema violation".into()));
            }
            return Err(MirrorError::Unavailable("connection refused".into()));
        }
        self.inner.apply(ev)
    }

    fn has_request(&self, id: &RequestId) -> bool {
        self.inner.has_request(id)
    }
}

#[tokio::test]
async fn test_transient_failure_retries_until_applied() {
    let store = Arc::new(FlakyStore {
        inner: MirrorStore::new(addr(0xaa)),
        remaining_failures: AtomicU32::new(3),
        permanent: false,
    });
    let mut rec = Reconciler::new(Arc::clone(&store), &fast_config());

    rec.handle(committed(1, None)).await;

    assert!(rec.status().parked.is_empty());
    assert_eq!(store.inner.list_transfers(None).len(), 1);
    assert_eq!(rec.last_seq(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_park_and_stream_continues() {
    let store = Arc::new(FlakyStore {
        inner: MirrorStore::new(addr(0xaa)),
        remaining_failures: AtomicU32::new(100),
        permanent: false,
    });
    let mut rec = Reconciler::new(Arc::clone(&store), &fast_config());

    rec.handle(committed(1, None)).await;

    let status = rec.status();
    assert_eq!(status.parked.len(), 1);
    assert_eq!(status.parked[0].seq, 1);
    // The checkpoint moved past the parked event; the stream is not stuck.
    assert_eq!(status.last_seq, 1);

    store.remaining_failures.store(0, Ordering::SeqCst);
    rec.handle(committed(2, None)).await;
    assert_eq!(store.inner.list_transfers(None).len(), 1);
    assert_eq!(rec.last_seq(), 2);
}

#[tokio::test]
async fn test_rejected_event_parks_immediately() {
    let store = Arc::new(FlakyStore {
        inner: MirrorStore::new(addr(0xaa)),
        remaining_failures: AtomicU32::new(1),
        permanent: true,
    });
    let mut rec = Reconciler::new(Arc::clone(&store), &fast_config());

    rec.handle(committed(1, None)).await;

    let status = rec.status();
    assert_eq!(status.parked.len(), 1);
    assert!(status.parked[0].error.contains("schema violation"));
}

#[tokio::test]
async fn test_parked_event_survives_restart_and_replays() {
    let dir = tempdir().unwrap();
    let mut cfg = fast_config();
    cfg.checkpoint_path = Some(dir.path().join("checkpoint.json"));

    let store = Arc::new(FlakyStore {
        inner: MirrorStore::new(addr(0xaa)),
        remaining_failures: AtomicU32::new(100),
        permanent: false,
    });

    {
        let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
        rec.handle(committed(1, None)).await;
        assert_eq!(rec.status().parked.len(), 1);
        assert_eq!(rec.last_seq(), 1);
    } // crash with the event parked

    let mut rec = Reconciler::new(Arc::clone(&store), &cfg);
    let status = rec.status();
    assert_eq!(status.parked.len(), 1, "parked event must survive the restart");
    assert_eq!(status.parked[0].event.seq, 1, "the full event is kept for replay");

    // Redelivery below the checkpoint stays a duplicate; replay is the way
    // back in once the store fault is repaired.
    rec.handle(committed(1, None)).await;
    assert!(store.inner.list_transfers(None).is_empty());

    store.remaining_failures.store(0, Ordering::SeqCst);
    assert!(!rec.replay_parked(99).await);
    assert!(rec.replay_parked(1).await);
    assert!(rec.status().parked.is_empty());
    assert_eq!(store.inner.list_transfers(None).len(), 1);
}
