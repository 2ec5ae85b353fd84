//! Watch reconciler: one long-running loop per kind.
//!
//! ```text
//! Idle -> Connecting -> Streaming -> { Error | Stale } -> RetryWait -> Connecting ...
//!                                                             \-> Stopped
//! ```
//!
//! A clean end of stream reconnects immediately from the last cursor. A
//! transient failure waits `retry_delay` first. A stale cursor is reported on
//! the resync channel and ends the loop; the supervisor re-lists every kind.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use cfgsync_core::{Classify, Dispatcher, FailureClass, KindInfo, Operation, ProcessRequest, Uid};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths::ApiRoot;
use crate::transport::{StreamControl, StreamStatus, Transport, TransportError};

const GONE: u16 = 410;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Connecting,
    Streaming,
    Error,
    Stale,
    RetryWait,
    Stopped,
}

/// Resume cursor of one kind, shared by the bulk synchronizer, its watcher and
/// the supervisor.
#[derive(Debug, Clone, Default)]
pub struct KindCursor(Arc<Mutex<String>>);

impl KindCursor {
    pub fn new(rv: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(rv.into())))
    }

    pub fn get(&self) -> String {
        self.0.lock().clone()
    }

    pub fn set(&self, rv: impl Into<String>) {
        *self.0.lock() = rv.into();
    }
}

/// Why a stream ended badly.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WatchFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("watch rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("error event: {0}")]
    ErrorEvent(String),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("resource version too old: {0}")]
    Stale(String),
}

impl Classify for WatchFailure {
    fn classify(&self) -> FailureClass {
        match self {
            WatchFailure::Stale(_) => FailureClass::ResyncRequired,
            _ => FailureClass::TransientRetry,
        }
    }
}

/// Posted by a watcher whose cursor was rejected as stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub kind: String,
    pub reason: String,
}

/// How a watcher loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Stopped,
    Stale,
}

/// The fields of a `metav1.Status` error body that matter for classification.
#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    code: Option<i64>,
    reason: Option<String>,
    message: Option<String>,
}

impl StatusBody {
    fn is_stale(&self) -> bool {
        self.code == Some(i64::from(GONE))
            || matches!(self.reason.as_deref(), Some("Expired") | Some("Gone"))
            || self.message.as_deref().map_or(false, |m| m.contains("too old resource version"))
    }
}

/// Classify the object of an ERROR event (normally a `Status`).
pub fn classify_error_object(object: &Value) -> WatchFailure {
    let body = object.to_string();
    match StatusBody::deserialize(object) {
        Ok(s) if s.is_stale() => WatchFailure::Stale(body),
        _ => WatchFailure::ErrorEvent(body),
    }
}

fn classify_rejection(status: u16, body: &[u8]) -> WatchFailure {
    let text = String::from_utf8_lossy(body).into_owned();
    let stale = status == GONE
        || serde_json::from_slice::<StatusBody>(body).map_or(false, |s| s.is_stale());
    if stale {
        WatchFailure::Stale(text)
    } else {
        WatchFailure::Rejected { status, body: text }
    }
}

/// Newline framing over arbitrarily split chunks.
#[derive(Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos);
        self.buf.advance(1);
        Some(line)
    }

    /// Unterminated tail left when the stream ends.
    fn take_rest(&mut self) -> Option<BytesMut> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        Some(self.buf.split())
    }
}

/// Per-kind event handling shared by the loop and its tests.
struct EventHandler<'a> {
    kind: &'a KindInfo,
    cursor: &'a KindCursor,
    dispatcher: &'a dyn Dispatcher,
}

impl EventHandler<'_> {
    /// Handle one complete line. `Err` aborts the stream.
    fn handle_line(&self, line: &[u8]) -> Result<(), WatchFailure> {
        let text = std::str::from_utf8(line).map_err(|e| WatchFailure::Malformed(e.to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let event: Value = serde_json::from_str(text).map_err(|e| WatchFailure::Malformed(e.to_string()))?;
        let Some(ty) = event.get("type").and_then(Value::as_str) else {
            // No type: the whole line is an error body.
            return Err(classify_error_object(&event));
        };
        let object = event.get("object").cloned().unwrap_or(Value::Null);
        match ty {
            "ERROR" => Err(classify_error_object(&object)),
            "BOOKMARK" => {
                if let Some(rv) = object.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
                    self.cursor.set(rv);
                }
                Ok(())
            }
            _ => match Operation::from_event_type(ty) {
                Some(op) => self.dispatch(op, object),
                None => {
                    debug!(kind = %self.kind.kind, event_type = %ty, "unknown event type ignored");
                    Ok(())
                }
            },
        }
    }

    fn dispatch(&self, op: Operation, mut object: Value) -> Result<(), WatchFailure> {
        let uid = object
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .map(Uid::parse)
            .ok_or_else(|| WatchFailure::Malformed("event object without metadata.uid".into()))?;
        let rv = object.pointer("/metadata/resourceVersion").and_then(Value::as_str).map(str::to_string);
        if let Some(obj) = object.as_object_mut() {
            obj.entry("kind").or_insert_with(|| Value::String(self.kind.kind.clone()));
        }
        self.dispatcher.enqueue(ProcessRequest::new(op, uid, object));
        if let Some(rv) = rv {
            self.cursor.set(rv);
        }
        metrics::counter!("watch_events_total", 1, "kind" => self.kind.kind.clone(), "op" => op.as_str());
        Ok(())
    }
}

enum StreamEnd {
    Closed,
    Cancelled,
    Failed(WatchFailure),
}

/// Everything a watcher loop needs.
pub struct WatchConfig {
    pub transport: Arc<dyn Transport>,
    pub root: ApiRoot,
    pub kind: KindInfo,
    pub cursor: KindCursor,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub resync_tx: mpsc::UnboundedSender<ResyncRequest>,
    pub retry_delay: Duration,
}

struct Watcher {
    cfg: WatchConfig,
    state: watch::Sender<WatchState>,
    cancel: CancellationToken,
}

impl Watcher {
    fn set_state(&self, s: WatchState) {
        self.state.send_replace(s);
    }

    async fn stream_once(&self) -> StreamEnd {
        let path = self.cfg.root.watch(&self.cfg.kind.name, &self.cfg.cursor.get());
        debug!(kind = %self.cfg.kind.kind, path = %path, "watch connecting");
        self.set_state(WatchState::Connecting);

        let handler = EventHandler {
            kind: &self.cfg.kind,
            cursor: &self.cfg.cursor,
            dispatcher: self.cfg.dispatcher.as_ref(),
        };
        let mut lines = LineBuffer::default();
        let mut failure: Option<WatchFailure> = None;
        let mut streaming = false;
        let state = &self.state;
        let mut on_bytes = |chunk: &[u8]| {
            if !streaming {
                streaming = true;
                state.send_replace(WatchState::Streaming);
            }
            lines.push(chunk);
            while let Some(line) = lines.next_line() {
                if let Err(f) = handler.handle_line(&line) {
                    failure = Some(f);
                    return StreamControl::Stop;
                }
            }
            StreamControl::Continue
        };
        let result = self.cfg.transport.streaming_get(&path, &mut on_bytes, &self.cancel).await;
        drop(on_bytes);

        if let Some(f) = failure {
            return StreamEnd::Failed(f);
        }
        match result {
            Ok(StreamStatus::Cancelled) => StreamEnd::Cancelled,
            Ok(StreamStatus::Closed) | Ok(StreamStatus::Aborted) => match lines.take_rest() {
                Some(tail) => match handler.handle_line(&tail) {
                    Ok(()) => StreamEnd::Closed,
                    Err(f) => StreamEnd::Failed(f),
                },
                None => StreamEnd::Closed,
            },
            Ok(StreamStatus::Rejected { status, body }) => StreamEnd::Failed(classify_rejection(status, &body)),
            Err(e) => StreamEnd::Failed(WatchFailure::Transport(e)),
        }
    }

    async fn run(self) -> WatchExit {
        let kind = self.cfg.kind.kind.clone();
        info!(kind = %kind, rv = %self.cfg.cursor.get(), "watch started");
        let exit = loop {
            if self.cancel.is_cancelled() {
                break WatchExit::Stopped;
            }
            match self.stream_once().await {
                StreamEnd::Cancelled => break WatchExit::Stopped,
                StreamEnd::Closed => {
                    debug!(kind = %kind, rv = %self.cfg.cursor.get(), "watch stream ended; reconnecting");
                    metrics::counter!("watch_reconnects_total", 1, "kind" => kind.clone(), "reason" => "closed");
                }
                StreamEnd::Failed(f) => match f.classify() {
                    FailureClass::ResyncRequired => {
                        self.set_state(WatchState::Stale);
                        warn!(kind = %kind, error = %f, "watch cursor is stale; requesting full resync");
                        let req = ResyncRequest { kind: kind.clone(), reason: f.to_string() };
                        if self.cfg.resync_tx.send(req).is_err() {
                            debug!(kind = %kind, "resync channel closed");
                        }
                        break WatchExit::Stale;
                    }
                    _ => {
                        self.set_state(WatchState::Error);
                        warn!(kind = %kind, error = %f, delay_s = self.cfg.retry_delay.as_secs_f64(), "watch failed; will reconnect");
                        metrics::counter!("watch_reconnects_total", 1, "kind" => kind.clone(), "reason" => "error");
                        self.set_state(WatchState::RetryWait);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break WatchExit::Stopped,
                            _ = tokio::time::sleep(self.cfg.retry_delay) => {}
                        }
                    }
                },
            }
        };
        if exit == WatchExit::Stopped {
            self.set_state(WatchState::Stopped);
        }
        info!(kind = %kind, exit = ?exit, "watch loop ended");
        exit
    }
}

/// Running watcher of one kind.
pub struct WatchHandle {
    kind: String,
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    join: JoinHandle<WatchExit>,
}

impl WatchHandle {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Interrupt any in-flight connection and join the loop.
    pub async fn stop(self) -> WatchExit {
        self.cancel.cancel();
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "watch task ended abnormally");
                WatchExit::Stopped
            }
        }
    }
}

/// Start the watch loop of one kind on its own task.
pub fn spawn_watch(cfg: WatchConfig) -> WatchHandle {
    let kind = cfg.kind.kind.clone();
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(WatchState::Idle);
    let watcher = Watcher { cfg, state: state_tx, cancel: cancel.clone() };
    let join = tokio::spawn(watcher.run());
    WatchHandle { kind, cancel, state: state_rx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProcessRequest>>);

    impl Dispatcher for Recorder {
        fn enqueue(&self, req: ProcessRequest) {
            self.0.lock().push(req);
        }
    }

    fn kind() -> KindInfo {
        KindInfo { name: "widgets".into(), singular_name: "widget".into(), namespaced: true, kind: "Widget".into() }
    }

    #[test]
    fn lines_reassemble_across_chunks() {
        let mut lb = LineBuffer::default();
        lb.push(b"{\"a\":");
        assert!(lb.next_line().is_none());
        lb.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(&lb.next_line().expect("line")[..], b"{\"a\":1}");
        assert_eq!(&lb.next_line().expect("line")[..], b"{\"b\":2}");
        assert!(lb.next_line().is_none());
        assert_eq!(&lb.take_rest().expect("tail")[..], b"{\"c\"");
        lb.push(b"  \n");
        assert!(lb.next_line().is_some());
        assert!(lb.take_rest().is_none());
    }

    #[test]
    fn added_event_dispatches_and_advances_cursor() {
        let k = kind();
        let cursor = KindCursor::new("1");
        let rec = Recorder::default();
        let h = EventHandler { kind: &k, cursor: &cursor, dispatcher: &rec };
        h.handle_line(br#"{"type":"ADDED","object":{"metadata":{"uid":"X","resourceVersion":"5"}}}"#)
            .expect("added");
        let got = rec.0.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].op, Operation::Create);
        assert_eq!(got[0].uid.as_str(), "X");
        assert_eq!(got[0].value["kind"], json!("Widget"));
        assert_eq!(cursor.get(), "5");
    }

    #[test]
    fn error_events_are_classified() {
        let k = kind();
        let cursor = KindCursor::new("7");
        let rec = Recorder::default();
        let h = EventHandler { kind: &k, cursor: &cursor, dispatcher: &rec };

        let stale = h
            .handle_line(br#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired","message":"too old resource version: 7 (9)"}}"#)
            .expect_err("stale");
        assert_eq!(stale.classify(), FailureClass::ResyncRequired);

        let other = h
            .handle_line(br#"{"type":"ERROR","object":{"kind":"Status","code":500,"message":"etcd unavailable"}}"#)
            .expect_err("error");
        assert_eq!(other.classify(), FailureClass::TransientRetry);

        let untyped = h.handle_line(br#"{"kind":"Status","code":410}"#).expect_err("untyped");
        assert_eq!(untyped.classify(), FailureClass::ResyncRequired);

        let garbage = h.handle_line(b"{not json").expect_err("malformed");
        assert!(matches!(garbage, WatchFailure::Malformed(_)));
        assert_eq!(cursor.get(), "7");
        assert!(rec.0.lock().is_empty());
    }

    #[test]
    fn bookmark_moves_cursor_without_dispatch() {
        let k = kind();
        let cursor = KindCursor::new("1");
        let rec = Recorder::default();
        let h = EventHandler { kind: &k, cursor: &cursor, dispatcher: &rec };
        h.handle_line(br#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"42"}}}"#)
            .expect("bookmark");
        assert_eq!(cursor.get(), "42");
        assert!(rec.0.lock().is_empty());
    }

    #[test]
    fn rejection_410_is_stale() {
        assert_eq!(classify_rejection(410, b"gone").classify(), FailureClass::ResyncRequired);
        assert_eq!(classify_rejection(500, b"boom").classify(), FailureClass::TransientRetry);
    }
}
