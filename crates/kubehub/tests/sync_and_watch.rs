#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cfgsync_core::{Classify, FailureClass, KindInfo, Operation};
use cfgsync_kubehub::testing::{RecordingDispatcher, ScriptedTransport, StreamScript};
use cfgsync_kubehub::{
    discover_kinds, spawn_watch, sync_kind, ApiRoot, KindCursor, ResyncRequest, SyncError, TransportError,
    WatchConfig, WatchExit, WatchState,
};
use serde_json::json;
use tokio::sync::mpsc;

fn root() -> ApiRoot {
    ApiRoot::new("core.cfgsync.io", "v1")
}

fn widgets() -> KindInfo {
    KindInfo { name: "widgets".into(), singular_name: "widget".into(), namespaced: true, kind: "Widget".into() }
}

fn item(uid: &str) -> serde_json::Value {
    json!({ "metadata": { "uid": uid, "name": uid, "namespace": "default" } })
}

const WATCH_PATH: &str = "/apis/core.cfgsync.io/v1/widgets";

struct Harness {
    transport: Arc<ScriptedTransport>,
    dispatcher: Arc<RecordingDispatcher>,
    cursor: KindCursor,
    resync_rx: mpsc::UnboundedReceiver<ResyncRequest>,
    cfg: Option<WatchConfig>,
}

fn harness(start_rv: &str) -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let cursor = KindCursor::new(start_rv);
    let (resync_tx, resync_rx) = mpsc::unbounded_channel();
    let cfg = WatchConfig {
        transport: transport.clone(),
        root: root(),
        kind: widgets(),
        cursor: cursor.clone(),
        dispatcher: dispatcher.clone(),
        resync_tx,
        retry_delay: Duration::from_secs(5),
    };
    Harness { transport, dispatcher, cursor, resync_rx, cfg: Some(cfg) }
}

#[tokio::test]
async fn bulk_sync_follows_continue_tokens() {
    let transport = ScriptedTransport::new();
    transport.on_get_json(
        "/apis/core.cfgsync.io/v1/widgets?limit=3",
        &json!({
            "items": [item("a"), item("b"), item("c")],
            "metadata": { "resourceVersion": "10", "continue": "tok" }
        }),
    );
    transport.on_get_json(
        "/apis/core.cfgsync.io/v1/widgets?limit=3&continue=tok",
        &json!({ "items": [item("d")], "metadata": { "resourceVersion": "12" } }),
    );

    let mut seen = Vec::new();
    let outcome = sync_kind(&transport, &root(), &widgets(), 3, |req| seen.push(req)).await.expect("sync");

    assert_eq!(transport.gets().len(), 2);
    assert_eq!(seen.iter().map(|r| r.uid.as_str().to_string()).collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
    assert!(seen.iter().all(|r| r.op == Operation::Create));
    assert!(seen.iter().all(|r| r.value["kind"] == json!("Widget")));
    assert_eq!(outcome.cursor, "12");
    assert_eq!(outcome.objects, 4);
    assert_eq!(outcome.pages, 2);
}

#[tokio::test]
async fn bulk_sync_aborts_on_failed_page() {
    let transport = ScriptedTransport::new();
    transport.on_get_json(
        "/apis/core.cfgsync.io/v1/widgets?limit=1",
        &json!({ "items": [item("a")], "metadata": { "resourceVersion": "3", "continue": "next" } }),
    );
    transport.on_get("/apis/core.cfgsync.io/v1/widgets?limit=1&continue=next", 500, "boom");

    let mut count = 0;
    let err = sync_kind(&transport, &root(), &widgets(), 1, |_| count += 1).await.expect_err("must fail");
    assert!(matches!(err, SyncError::Status { status: 500, .. }));
    assert_eq!(err.classify(), FailureClass::TransientRetry);
    assert_eq!(count, 1);

    let broken = ScriptedTransport::new();
    broken.on_get("/apis/core.cfgsync.io/v1/widgets?limit=1", 200, "{\"items\": [");
    let err = sync_kind(&broken, &root(), &widgets(), 1, |_| {}).await.expect_err("parse");
    assert!(matches!(err, SyncError::Parse { .. }));

    let down = ScriptedTransport::new();
    down.on_get_error("/apis/core.cfgsync.io/v1/widgets?limit=1", TransportError::Connect("refused".into()));
    let err = sync_kind(&down, &root(), &widgets(), 1, |_| {}).await.expect_err("transport");
    assert!(matches!(err, SyncError::Transport(_)));
}

#[tokio::test]
async fn discovery_skips_status_and_honours_allow_list() {
    let transport = ScriptedTransport::new();
    transport.on_get_json(
        "/apis/core.cfgsync.io/v1",
        &json!({
            "resources": [
                { "name": "widgets", "singularName": "widget", "namespaced": true, "kind": "Widget" },
                { "name": "widgets/status", "singularName": "", "namespaced": true, "kind": "Widget" },
                { "name": "gadgets", "singularName": "gadget", "namespaced": false, "kind": "Gadget" }
            ]
        }),
    );

    let all = discover_kinds(&transport, &root(), &[]).await.expect("discover");
    assert_eq!(all.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["widgets", "gadgets"]);

    // Entries match the resource name or the kind, ignoring case.
    let by_kind = discover_kinds(&transport, &root(), &["gadgetz".into(), "widget".into()]).await.expect("discover");
    assert_eq!(by_kind.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["widgets"]);

    let by_name = discover_kinds(&transport, &root(), &["GADGETS".into()]).await.expect("discover");
    assert_eq!(by_name.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["gadgets"]);
}

#[tokio::test]
async fn added_event_dispatches_once_and_resumes_from_its_cursor() {
    let mut h = harness("1");
    h.transport.on_stream(
        WATCH_PATH,
        StreamScript::lines([r#"{"type":"ADDED","object":{"metadata":{"uid":"X","resourceVersion":"5"}}}"#]),
    );
    let handle = spawn_watch(h.cfg.take().expect("cfg"));

    let watches = h.transport.wait_for_watches(WATCH_PATH, 2, Duration::from_secs(5)).await;
    assert_eq!(watches[0], format!("{}?watch=1&resourceVersion=1", WATCH_PATH));
    assert_eq!(watches[1], format!("{}?watch=1&resourceVersion=5", WATCH_PATH));

    let reqs = h.dispatcher.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].op, Operation::Create);
    assert_eq!(reqs[0].uid.as_str(), "X");
    assert_eq!(h.cursor.get(), "5");

    assert_eq!(handle.stop().await, WatchExit::Stopped);
    assert!(h.resync_rx.try_recv().is_err());
}

#[tokio::test]
async fn events_split_across_chunks_are_reassembled() {
    let mut h = harness("1");
    let line1 = r#"{"type":"ADDED","object":{"metadata":{"uid":"a","resourceVersion":"2"}}}"#;
    let line2 = r#"{"type":"MODIFIED","object":{"metadata":{"uid":"a","resourceVersion":"3"}}}"#;
    let line3 = r#"{"type":"DELETED","object":{"metadata":{"uid":"a","resourceVersion":"4"}}}"#;
    let all = format!("{}\n{}\n{}\n", line1, line2, line3);
    let (p1, rest) = all.split_at(17);
    let (p2, p3) = rest.split_at(line1.len() + 9);
    h.transport.on_stream(
        WATCH_PATH,
        StreamScript::Chunks(vec![Bytes::from(p1.to_string()), Bytes::from(p2.to_string()), Bytes::from(p3.to_string())]),
    );
    let handle = spawn_watch(h.cfg.take().expect("cfg"));
    h.transport.wait_for_watches(WATCH_PATH, 2, Duration::from_secs(5)).await;

    let ops: Vec<Operation> = h.dispatcher.requests().into_iter().map(|r| r.op).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update, Operation::Delete]);
    assert_eq!(h.cursor.get(), "4");
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failure_waits_then_resumes_from_last_cursor() {
    let mut h = harness("1");
    h.transport.on_stream(
        WATCH_PATH,
        StreamScript::lines([
            r#"{"type":"ADDED","object":{"metadata":{"uid":"a","resourceVersion":"7"}}}"#,
            r#"{"type":"ERROR","object":{"kind":"Status","code":500,"message":"internal"}}"#,
        ]),
    );
    h.transport.on_stream(WATCH_PATH, StreamScript::Fail(TransportError::Io("reset".into())));
    let handle = spawn_watch(h.cfg.take().expect("cfg"));
    let mut state = handle.subscribe_state();

    let started = tokio::time::Instant::now();
    let watches = h.transport.wait_for_watches(WATCH_PATH, 3, Duration::from_secs(60)).await;
    assert_eq!(watches.len(), 3);
    assert!(watches[1].ends_with("resourceVersion=7"));
    assert!(watches[2].ends_with("resourceVersion=7"));
    // two failures, each followed by the retry delay
    assert!(started.elapsed() >= Duration::from_secs(10));

    state.wait_for(|s| *s == WatchState::Connecting || *s == WatchState::Streaming).await.expect("state");
    assert!(h.resync_rx.try_recv().is_err());
    assert_eq!(handle.stop().await, WatchExit::Stopped);
}

#[tokio::test]
async fn stale_error_event_requests_resync_and_ends_loop() {
    let mut h = harness("3");
    h.transport.on_stream(
        WATCH_PATH,
        StreamScript::lines([
            r#"{"type":"ERROR","object":{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"Expired","code":410,"message":"too old resource version: 3 (10)"}}"#,
        ]),
    );
    let handle = spawn_watch(h.cfg.take().expect("cfg"));

    let req = tokio::time::timeout(Duration::from_secs(5), h.resync_rx.recv())
        .await
        .expect("resync in time")
        .expect("resync request");
    assert_eq!(req.kind, "Widget");
    assert_eq!(handle.stop().await, WatchExit::Stale);
    assert_eq!(h.transport.watches().len(), 1);
    assert!(h.dispatcher.is_empty());
}

#[tokio::test]
async fn rejected_410_at_connect_is_stale() {
    let mut h = harness("3");
    h.transport.on_stream(WATCH_PATH, StreamScript::Reject { status: 410, body: Bytes::from_static(b"{}") });
    let handle = spawn_watch(h.cfg.take().expect("cfg"));
    let req = tokio::time::timeout(Duration::from_secs(5), h.resync_rx.recv()).await.expect("in time");
    assert!(req.is_some());
    assert_eq!(handle.stop().await, WatchExit::Stale);
}

#[tokio::test]
async fn stop_interrupts_idle_stream() {
    let h = {
        let mut h = harness("9");
        let handle = spawn_watch(h.cfg.take().expect("cfg"));
        h.transport.wait_for_watches(WATCH_PATH, 1, Duration::from_secs(5)).await;
        assert_eq!(tokio::time::timeout(Duration::from_secs(5), handle.stop()).await.expect("joined"), WatchExit::Stopped);
        h
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.watches().len(), 1);
}
