//! cfgsync store: the partition pipeline.
//!
//! Requests are routed by identity onto N fixed partitions. Each partition
//! runs a single processing loop that owns its cache entries and retry timers;
//! readers get lock-free cache snapshots for diagnostics.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cfgsync_core::{ConfigSink, Dispatcher, Operation, PartitionPlanner, ProcessRequest, Translator, Uid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cache;
mod coalescer;
mod partition;

pub use cache::{CacheEntrySummary, CacheQuery, RetryPolicy};
pub use coalescer::Coalescer;

use partition::{Partition, PartitionShared};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    pub partitions: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { partitions: 4, retry: RetryPolicy::default() }
    }
}

/// Identity-partitioned worker pipeline. Implements [`Dispatcher`]; safe to
/// enqueue into from any task or thread.
pub struct PartitionPipeline {
    planner: PartitionPlanner,
    shared: Vec<Arc<PartitionShared>>,
    staged: Mutex<Vec<Partition>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    epoch_rx: watch::Receiver<u64>,
}

impl PartitionPipeline {
    /// Build the pipeline without starting its tasks. Requests enqueued before
    /// [`start`](Self::start) are held and coalesced.
    pub fn new(config: PipelineConfig, translator: Arc<dyn Translator>, sink: Arc<dyn ConfigSink>) -> Self {
        let planner = PartitionPlanner::new(config.partitions);
        let shutdown = CancellationToken::new();
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let epoch_tx = Arc::new(epoch_tx);
        let mut shared = Vec::with_capacity(planner.partitions());
        let mut staged = Vec::with_capacity(planner.partitions());
        for index in 0..planner.partitions() {
            let s = Arc::new(PartitionShared::new());
            staged.push(Partition::new(
                index,
                Arc::clone(&s),
                Arc::clone(&translator),
                Arc::clone(&sink),
                config.retry,
                shutdown.child_token(),
                Arc::clone(&epoch_tx),
            ));
            shared.push(s);
        }
        Self {
            planner,
            shared,
            staged: Mutex::new(staged),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
            epoch_rx,
        }
    }

    /// Build and start on the current tokio runtime.
    pub fn spawn(config: PipelineConfig, translator: Arc<dyn Translator>, sink: Arc<dyn ConfigSink>) -> Arc<Self> {
        let pipeline = Arc::new(Self::new(config, translator, sink));
        pipeline.start();
        pipeline
    }

    /// Spawn one task per partition. Calling it again is a no-op.
    pub fn start(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock();
        for p in staged {
            tasks.push(tokio::spawn(p.run()));
        }
        info!(partitions = self.planner.partitions(), "partition pipeline started");
    }

    pub fn partitions(&self) -> usize {
        self.planner.partitions()
    }

    pub fn partition_of(&self, uid: &Uid) -> usize {
        self.planner.partition_of(uid)
    }

    /// Requests waiting in pending queues across all partitions.
    pub fn pending_len(&self) -> usize {
        self.shared.iter().map(|s| s.pending.lock().len()).sum()
    }

    /// Cache entries as of the latest published snapshots.
    pub fn cache_len(&self) -> usize {
        self.shared.iter().map(|s| s.snapshot.load().len()).sum()
    }

    /// Paginated read of the cache, ordered by identity text. Reads published
    /// snapshots only; never touches partition state.
    pub fn show_cache(&self, query: &CacheQuery) -> Vec<CacheEntrySummary> {
        let limit = query.effective_limit();
        let after = query.after.as_deref().map(Uid::parse);
        let lower = match &after {
            Some(uid) => Bound::Excluded(uid),
            None => Bound::Unbounded,
        };
        let selected: Vec<&Arc<PartitionShared>> = match query.partition {
            Some(p) => self.shared.get(p).into_iter().collect(),
            None => self.shared.iter().collect(),
        };
        let mut out = Vec::new();
        for s in selected {
            let snap = s.snapshot.load();
            out.extend(
                snap.range::<Uid, _>((lower, Bound::Unbounded))
                    .map(|(_, v)| v)
                    .filter(|v| query.matches(v))
                    .take(limit)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.uid.cmp(&b.uid));
        out.truncate(limit);
        out
    }

    /// Whether `property` was present but empty on the last applied record.
    /// `None` when the identity or the property is unknown.
    pub fn is_list_or_map_prop_empty(&self, uid: &Uid, property: &str) -> Option<bool> {
        let snap = self.shared[self.planner.partition_of(uid)].snapshot.load();
        snap.get(uid).and_then(|s| s.empty_props.get(property).copied())
    }

    /// Identities currently known to the pipeline: cached or pending.
    pub fn known_uids(&self) -> HashSet<Uid> {
        let mut out = HashSet::new();
        for s in &self.shared {
            out.extend(s.snapshot.load().keys().cloned());
            out.extend(s.pending.lock().uids().cloned());
        }
        out
    }

    /// Enqueue a DELETE for every known identity not in `seen`. Returns how many.
    pub fn sweep_absent(&self, seen: &HashSet<Uid>) -> usize {
        let mut swept = 0;
        for uid in self.known_uids() {
            if !seen.contains(&uid) {
                self.enqueue(ProcessRequest::new(Operation::Delete, uid, serde_json::Value::Null));
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "removed identities absent from full resync");
        }
        swept
    }

    /// Wait until every request posted so far has been processed.
    pub async fn wait_idle(&self) {
        let mut rx = self.epoch_rx.clone();
        loop {
            let _ = rx.borrow_and_update();
            if self.outstanding() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.shared.iter().map(|s| s.outstanding.load(Ordering::Acquire)).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting requests, let each partition drain what is pending
    /// without arming new retries, cancel all timers and join the tasks.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "partition task ended abnormally");
            }
        }
        info!("partition pipeline stopped");
    }
}

impl Dispatcher for PartitionPipeline {
    fn enqueue(&self, req: ProcessRequest) {
        if self.is_closed() {
            debug!(uid = %req.uid, op = %req.op, "pipeline closed; request dropped");
            return;
        }
        let p = self.planner.partition_of(&req.uid);
        let coalesced = if self.shared[p].post(req) { "true" } else { "false" };
        metrics::counter!("pipeline_enqueued_total", 1, "coalesced" => coalesced);
    }
}

impl Drop for PartitionPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One downstream callback, as seen by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Object { uid: Uid, op: Operation, record: serde_json::Value },
    BulkSyncComplete { kind: String },
}

/// In-memory [`ConfigSink`]: records every callback and keeps the applied state.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
    state: Mutex<BTreeMap<Uid, serde_json::Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Object callbacks only, in arrival order.
    pub fn objects(&self) -> Vec<(Uid, Operation, serde_json::Value)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Object { uid, op, record } => Some((uid.clone(), *op, record.clone())),
                SinkEvent::BulkSyncComplete { .. } => None,
            })
            .collect()
    }

    pub fn completed_kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::BulkSyncComplete { kind } => Some(kind.clone()),
                SinkEvent::Object { .. } => None,
            })
            .collect()
    }

    /// Records currently applied (created/updated and not deleted).
    pub fn state(&self) -> BTreeMap<Uid, serde_json::Value> {
        self.state.lock().clone()
    }

    pub fn get(&self, uid: &Uid) -> Option<serde_json::Value> {
        self.state.lock().get(uid).cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ConfigSink for MemorySink {
    fn on_object(&self, uid: &Uid, record: &serde_json::Value, op: Operation) {
        {
            let mut state = self.state.lock();
            match op {
                Operation::Delete => {
                    state.remove(uid);
                }
                Operation::Create | Operation::Update => {
                    state.insert(uid.clone(), record.clone());
                }
            }
        }
        self.events.lock().push(SinkEvent::Object { uid: uid.clone(), op, record: record.clone() });
    }

    fn on_bulk_sync_complete(&self, kind: &str) {
        self.events.lock().push(SinkEvent::BulkSyncComplete { kind: kind.to_string() });
    }
}
