//! In-memory transport with canned responses, for tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cfgsync_core::{Dispatcher, ProcessRequest};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::transport::{HttpResponse, StreamControl, StreamStatus, Transport, TransportError};

/// One scripted streaming session.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Deliver the chunks, then close.
    Chunks(Vec<Bytes>),
    /// Refuse the request.
    Reject { status: u16, body: Bytes },
    /// Fail with a transport error.
    Fail(TransportError),
}

impl StreamScript {
    /// One chunk per line, each newline-terminated.
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        StreamScript::Chunks(lines.into_iter().map(|l| Bytes::from(format!("{}\n", l.as_ref()))).collect())
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Reply(Result<HttpResponse, TransportError>),
    /// Never answers; the caller has to give up on the request.
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Watch(String),
}

/// Transport answering from scripts.
///
/// GET responses are keyed by exact path; when several are queued for a path
/// they are served in order and the last one repeats. Stream sessions are
/// keyed by collection path (query stripped) and consumed in order; once a
/// path has no sessions left the stream idles until cancelled.
#[derive(Default)]
pub struct ScriptedTransport {
    gets: Mutex<HashMap<String, VecDeque<Canned>>>,
    streams: Mutex<HashMap<String, VecDeque<StreamScript>>>,
    calls: Mutex<Vec<Call>>,
}

fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, path: impl Into<String>, status: u16, body: impl Into<Bytes>) -> &Self {
        self.gets
            .lock()
            .entry(path.into())
            .or_default()
            .push_back(Canned::Reply(Ok(HttpResponse { status, body: body.into() })));
        self
    }

    pub fn on_get_json(&self, path: impl Into<String>, body: &serde_json::Value) -> &Self {
        self.on_get(path, 200, body.to_string())
    }

    pub fn on_get_error(&self, path: impl Into<String>, err: TransportError) -> &Self {
        self.gets.lock().entry(path.into()).or_default().push_back(Canned::Reply(Err(err)));
        self
    }

    /// Queue a GET that never completes.
    pub fn on_get_stall(&self, path: impl Into<String>) -> &Self {
        self.gets.lock().entry(path.into()).or_default().push_back(Canned::Stall);
        self
    }

    /// Queue a streaming session for the collection at `path`.
    pub fn on_stream(&self, path: impl Into<String>, script: StreamScript) -> &Self {
        self.streams.lock().entry(path.into()).or_default().push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn gets(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Get(p) => Some(p.clone()),
                Call::Watch(_) => None,
            })
            .collect()
    }

    pub fn watches(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Watch(p) => Some(p.clone()),
                Call::Get(_) => None,
            })
            .collect()
    }

    /// Poll until at least `n` watch connections were opened for paths
    /// starting with `prefix`, or `timeout` passes. Returns the matching paths.
    pub async fn wait_for_watches(&self, prefix: &str, n: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen: Vec<String> = self.watches().into_iter().filter(|p| p.starts_with(prefix)).collect();
            if seen.len() >= n || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.calls.lock().push(Call::Get(path.to_string()));
        let canned = {
            let mut gets = self.gets.lock();
            match gets.get_mut(path) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match canned {
            Some(Canned::Reply(reply)) => reply,
            Some(Canned::Stall) => std::future::pending().await,
            None => Ok(not_found(path)),
        }
    }

    async fn streaming_get(
        &self,
        path: &str,
        on_bytes: &mut (dyn for<'b> FnMut(&'b [u8]) -> StreamControl + Send),
        cancel: &CancellationToken,
    ) -> Result<StreamStatus, TransportError> {
        self.calls.lock().push(Call::Watch(path.to_string()));
        let script = self.streams.lock().get_mut(strip_query(path)).and_then(VecDeque::pop_front);
        match script {
            Some(StreamScript::Chunks(chunks)) => {
                for chunk in chunks {
                    if cancel.is_cancelled() {
                        return Ok(StreamStatus::Cancelled);
                    }
                    if on_bytes(&chunk) == StreamControl::Stop {
                        return Ok(StreamStatus::Aborted);
                    }
                    tokio::task::yield_now().await;
                }
                Ok(StreamStatus::Closed)
            }
            Some(StreamScript::Reject { status, body }) => Ok(StreamStatus::Rejected { status, body }),
            Some(StreamScript::Fail(e)) => Err(e),
            None => {
                cancel.cancelled().await;
                Ok(StreamStatus::Cancelled)
            }
        }
    }
}

fn not_found(path: &str) -> HttpResponse {
    HttpResponse {
        status: 404,
        body: Bytes::from(format!(r#"{{"kind":"Status","code":404,"message":"{} not scripted"}}"#, path)),
    }
}

/// Dispatcher that records every request.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<ProcessRequest>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn enqueue(&self, req: ProcessRequest) {
        self.requests.lock().push(req);
    }
}
