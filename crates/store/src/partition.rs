use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use cfgsync_core::{ConfigSink, Operation, ProcessRequest, Translator, Uid};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheEntrySummary, PendingRetry, RetryPolicy};
use crate::coalescer::Coalescer;

pub(crate) type SummaryMap = BTreeMap<Uid, CacheEntrySummary>;

/// State shared between enqueuers and the single partition task.
pub(crate) struct PartitionShared {
    pub pending: Mutex<Coalescer>,
    pub notify: Notify,
    pub snapshot: ArcSwap<SummaryMap>,
    /// Requests posted and not yet processed (coalesced ones count once).
    pub outstanding: AtomicUsize,
}

impl PartitionShared {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Coalescer::new()),
            notify: Notify::new(),
            snapshot: ArcSwap::from_pointee(SummaryMap::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Returns true when the request was coalesced into a pending one.
    pub fn post(&self, req: ProcessRequest) -> bool {
        let coalesced = {
            let mut pending = self.pending.lock();
            let coalesced = pending.push(req);
            // counted under the lock so a concurrent drain never sees the request uncounted
            if !coalesced {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
            }
            coalesced
        };
        self.notify.notify_one();
        coalesced
    }
}

/// One partition: serialized processing loop owning its cache and retry timers.
pub(crate) struct Partition {
    index: usize,
    shared: Arc<PartitionShared>,
    cache: FxHashMap<Uid, CacheEntry>,
    retries: DelayQueue<Uid>,
    summaries: Arc<SummaryMap>,
    dirty: bool,
    /// Requests processed since the last publish.
    processed: usize,
    translator: Arc<dyn Translator>,
    sink: Arc<dyn ConfigSink>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    epoch_tx: Arc<watch::Sender<u64>>,
}

impl Partition {
    pub fn new(
        index: usize,
        shared: Arc<PartitionShared>,
        translator: Arc<dyn Translator>,
        sink: Arc<dyn ConfigSink>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
        epoch_tx: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            index,
            shared,
            cache: FxHashMap::default(),
            retries: DelayQueue::new(),
            summaries: Arc::new(SummaryMap::new()),
            dirty: false,
            processed: 0,
            translator,
            sink,
            policy,
            shutdown,
            epoch_tx,
        }
    }

    pub async fn run(mut self) {
        debug!(partition = self.index, "partition loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.shared.notify.notified() => self.drain(true),
                Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                    self.retry_expired(expired.into_inner());
                }
            }
            self.publish();
        }

        // Apply what is already pending, but arm nothing new.
        self.drain(false);
        let armed = self.retries.len();
        self.retries.clear();
        let index = self.index;
        let summaries = Arc::make_mut(&mut self.summaries);
        for (uid, entry) in self.cache.iter_mut() {
            if entry.retry.take().is_some() {
                summaries.insert(uid.clone(), entry.summarize(uid, index));
            }
        }
        self.dirty = true;
        self.publish();
        info!(partition = self.index, cancelled_retries = armed, "partition loop stopped");
    }

    fn drain(&mut self, allow_retry: bool) {
        let batch = self.shared.pending.lock().drain_ready();
        for req in batch {
            self.process(req, allow_retry);
            self.processed += 1;
        }
    }

    fn retry_expired(&mut self, uid: Uid) {
        let Some(entry) = self.cache.get_mut(&uid) else { return };
        let Some(retry) = entry.retry.take() else { return };
        self.dirty = true;
        // A newer request for this identity is already queued and supersedes the retry.
        if self.shared.pending.lock().contains(&uid) {
            debug!(partition = self.index, uid = %uid, "retry superseded by pending request");
            let summary = entry.summarize(&uid, self.index);
            Arc::make_mut(&mut self.summaries).insert(uid, summary);
            return;
        }
        debug!(partition = self.index, uid = %uid, attempt = entry.retry_count, "retrying");
        self.process(retry.req, true);
    }

    fn process(&mut self, req: ProcessRequest, allow_retry: bool) {
        self.dirty = true;
        match req.op {
            Operation::Delete => self.process_delete(&req.uid),
            Operation::Create | Operation::Update => self.process_update(req, allow_retry),
        }
    }

    fn process_delete(&mut self, uid: &Uid) {
        let Some(entry) = self.cache.remove(uid) else {
            debug!(partition = self.index, uid = %uid, "delete for unknown identity ignored");
            return;
        };
        if let Some(retry) = entry.retry {
            self.retries.remove(&retry.key);
        }
        Arc::make_mut(&mut self.summaries).remove(uid);
        if let Some(record) = entry.record {
            self.sink.on_object(uid, &record, Operation::Delete);
            metrics::counter!("pipeline_deleted_total", 1);
        }
    }

    fn process_update(&mut self, req: ProcessRequest, allow_retry: bool) {
        let now = Utc::now();
        let uid = req.uid.clone();
        let entry = self.cache.entry(uid.clone()).or_insert_with(|| CacheEntry::new(now));
        entry.last_read = now;
        if let Some(retry) = entry.retry.take() {
            self.retries.remove(&retry.key);
        }

        match self.translator.translate(&uid, &req.value) {
            Ok(out) => {
                entry.retry_count = 0;
                entry.empty_props = out.empty_props;
                self.sink.on_object(&uid, &out.record, req.op);
                entry.record = Some(out.record);
                entry.raw = Some(req.value);
                metrics::counter!("pipeline_applied_total", 1);
            }
            Err(e) => {
                entry.retry_count = entry.retry_count.saturating_add(1);
                metrics::counter!("pipeline_retries_total", 1);
                if allow_retry {
                    let delay = self.policy.delay(entry.retry_count);
                    let key = self.retries.insert(uid.clone(), delay);
                    warn!(
                        partition = self.index,
                        uid = %uid,
                        error = %e,
                        attempt = entry.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "translation failed; retry armed"
                    );
                    entry.retry = Some(PendingRetry { key, req });
                } else {
                    warn!(partition = self.index, uid = %uid, error = %e, "translation failed during shutdown; dropped");
                }
            }
        }
        let summary = entry.summarize(&uid, self.index);
        Arc::make_mut(&mut self.summaries).insert(uid, summary);
    }

    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.shared.snapshot.store(Arc::clone(&self.summaries));
        // Only now are the processed requests visible to readers.
        self.shared.outstanding.fetch_sub(std::mem::take(&mut self.processed), Ordering::AcqRel);
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        metrics::gauge!("cache_entries", self.cache.len() as f64, "partition" => self.index.to_string());
    }
}
