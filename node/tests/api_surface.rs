use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use pocket_kernel::types::Address;
use pocket_node::api::{
    AddDelegateRequest, ApproveSpendRequest, ApproveSpendResponse, SubmitSpendRequest, SubmitSpendResponse,
};
use pocket_node::config::NodeConfig;
use pocket_node::ledger::SimLedger;
use pocket_node::mirror::MirrorStore;
use pocket_node::reconciler::Reconciler;
use pocket_node::server::{build_router, AppState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceExt; // for oneshot

fn addr(b: u8) -> Address {
    Address([b; 20])
}

fn make_state() -> AppState {
    let owner = addr(0xaa);
    let mirror = Arc::new(MirrorStore::new(owner));
    let reconciler = Arc::new(Mutex::new(Reconciler::new(Arc::clone(&mirror), &NodeConfig::default())));
    AppState {
        ledger: Arc::new(SimLedger::open(owner, None).unwrap()),
        mirror,
        reconciler,
    }
}

/// The background feed task is not running under oneshot; pump the stream
/// into the mirror by hand.
async fn reconcile(state: &AppState) {
    let mut rec = state.reconciler.lock().await;
    let (history, _rx) = state.ledger.subscribe(rec.last_seq() + 1).await;
    for ev in history {
        rec.handle(ev).await;
    }
}

fn post(uri: &str, body: impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_is_open() {
    let app = build_router(make_state(), None);
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_rejects_missing_and_wrong_token() {
    let app = build_router(make_state(), Some("sekrit".into()));

    let resp = app.clone().oneshot(get("/v1/grants")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let mut req = get("/v1/grants");
    req.headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let mut req = get("/v1/grants");
    req.headers_mut()
        .insert("authorization", "Bearer sekrit".parse().unwrap());
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_grant_roundtrip_through_mirror() {
    let state = make_state();
    let app = build_router(state.clone(), None);

    let resp = app
        .clone()
        .oneshot(post(
            "/v1/delegates",
            AddDelegateRequest {
                delegate: addr(1),
                requires_approval: false,
                daily_limit: 25,
                name: "Kid".into(),
            },
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    reconcile(&state).await;

    let resp = app.clone().oneshot(get("/v1/grants")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["grants"].as_array().unwrap().len(), 1);
    assert_eq!(body["grants"][0]["daily_limit"], 25);

    let resp = app
        .oneshot(get(&format!("/v1/grants/{}/allowance", addr(1))))
        .await
        .unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["available"], 25);
}

#[tokio::test]
async fn test_denied_spend_is_403_with_reason() {
    let state = make_state();
    let app = build_router(state.clone(), None);

    app.clone()
        .oneshot(post(
            "/v1/delegates",
            AddDelegateRequest {
                delegate: addr(1),
                requires_approval: false,
                daily_limit: 5,
                name: "Kid".into(),
            },
        ))
        .await
        .unwrap();

    let resp = app
        .oneshot(post(
            "/v1/spend",
            SubmitSpendRequest {
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 6,
                description: String::new(),
            },
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["error"], "daily limit exceeded");
}

#[tokio::test]
async fn test_queue_approve_spend_flow() {
    let state = make_state();
    let app = build_router(state.clone(), None);

    app.clone()
        .oneshot(post(
            "/v1/delegates",
            AddDelegateRequest {
                delegate: addr(1),
                requires_approval: true,
                daily_limit: 50,
                name: "Teen".into(),
            },
        ))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(post(
            "/v1/spend",
            SubmitSpendRequest {
                delegate: addr(1),
                asset: addr(2),
                to: addr(3),
                amount: 20,
                description: "books".into(),
            },
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let submit: SubmitSpendResponse = json_body(resp).await;
    assert_eq!(submit.status, "queued");
    let request_id = submit.request_id.unwrap();

    reconcile(&state).await;
    let resp = app.clone().oneshot(get("/v1/requests/pending")).await.unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["requests"].as_array().unwrap().len(), 1);

    let resp = app
        .clone()
        .oneshot(post("/v1/spend/approve", ApproveSpendRequest { request_id }))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let approve: ApproveSpendResponse = json_body(resp).await;
    assert!(approve.settlement_ref.starts_with("0x"));

    reconcile(&state).await;
    let resp = app
        .clone()
        .oneshot(get(&format!("/v1/requests/{request_id}")))
        .await
        .unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["status"], "approved");
    assert_eq!(body["settlement_ref"], approve.settlement_ref.as_str());

    let resp = app.oneshot(get("/v1/transfers")).await.unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["transfers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_stream_resumes_from_start_seq() {
    use futures::StreamExt;
    use pocket_kernel::event::SequencedEvent;

    let state = make_state();
    let app = build_router(state.clone(), None);

    for b in [1u8, 2] {
        app.clone()
            .oneshot(post(
                "/v1/delegates",
                AddDelegateRequest {
                    delegate: addr(b),
                    requires_approval: false,
                    daily_limit: 10,
                    name: String::new(),
                },
            ))
            .await
            .unwrap();
    }

    let resp = app
        .oneshot(get("/v1/ledger/events?start_seq=2"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The stream stays open for live events; read only up to the first
    // complete line.
    let mut body = resp.into_body().into_data_stream();
    let mut buffer = String::new();
    while !buffer.contains('\n') {
        let chunk = body.next().await.unwrap().unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }

    let line = buffer.lines().next().unwrap();
    let ev: SequencedEvent = serde_json::from_str(line).unwrap();
    assert_eq!(ev.seq, 2, "history must start at start_seq, not 1");
}

#[tokio::test]
async fn test_follower_replicates_over_http() {
    use pocket_node::ledger::LedgerClient;
    use pocket_node::reconciler::run_stream;
    use std::time::Duration;

    let state = make_state();
    let app = build_router(state, None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bound = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = LedgerClient::new(format!("http://{bound}"), None);

    // Drive commands through the remote client rather than a local handle.
    client
        .set_grant(&AddDelegateRequest {
            delegate: addr(1),
            requires_approval: false,
            daily_limit: 10,
            name: "Kid".into(),
        })
        .await
        .unwrap();
    let submit = client
        .submit_spend(&SubmitSpendRequest {
            delegate: addr(1),
            asset: addr(2),
            to: addr(3),
            amount: 4,
            description: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(submit.status, "committed");
    assert_eq!(client.head_seq().await.unwrap(), 2);

    // A denied spend comes back as a client error, not a transport failure.
    let denied = client
        .submit_spend(&SubmitSpendRequest {
            delegate: addr(1),
            asset: addr(2),
            to: addr(3),
            amount: 7,
            description: String::new(),
        })
        .await;
    assert!(matches!(denied, Err(pocket_node::errors::NodeError::InvalidInput(_))));

    // A second mirror catches up from the leader's NDJSON stream.
    let follower = Arc::new(MirrorStore::new(addr(0xaa)));
    let rec = Arc::new(Mutex::new(Reconciler::new(
        Arc::clone(&follower),
        &NodeConfig::default(),
    )));
    let feed = tokio::spawn(run_stream(Arc::clone(&rec), client, 20));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while follower.list_transfers(None).is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never caught up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    feed.abort();

    assert_eq!(follower.list_grants(None).len(), 1);
    assert_eq!(rec.lock().await.last_seq(), 2);
}

#[tokio::test]
async fn test_reconciler_status_reports_lag() {
    let state = make_state();
    let app = build_router(state.clone(), None);

    app.clone()
        .oneshot(post(
            "/v1/delegates",
            AddDelegateRequest {
                delegate: addr(1),
                requires_approval: false,
                daily_limit: 25,
                name: "Kid".into(),
            },
        ))
        .await
        .unwrap();

    // Not reconciled yet: head 1, mirror 0.
    let resp = app.clone().oneshot(get("/v1/reconciler/status")).await.unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["head_seq"], 1);
    assert_eq!(body["lag"], 1);

    reconcile(&state).await;
    let resp = app.oneshot(get("/v1/reconciler/status")).await.unwrap();
    let body: serde_json::Value = json_body(resp).await;
    assert_eq!(body["lag"], 0);
}
