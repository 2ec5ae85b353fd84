use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cfgsync_core::{Classify, ConfigSink, Dispatcher, KindInfo, Translator, Uid};
use cfgsync_kubehub::{
    discover_kinds, spawn_watch, sync_kind, ApiRoot, KindCursor, KubeTransport, ResyncRequest, Transport, WatchConfig,
    WatchHandle,
};
use cfgsync_schema::SchemaTranslator;
use cfgsync_store::{CacheEntrySummary, CacheQuery, PartitionPipeline};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ClientError, ClientOptions, ClientResult, ConfigClient};

#[derive(Debug, Clone)]
struct KindEntry {
    info: KindInfo,
    cursor: KindCursor,
}

/// Config client backed by a Kubernetes-compatible API server.
pub struct K8sConfigClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    root: ApiRoot,
    transport: Arc<dyn Transport>,
    pipeline: Arc<PartitionPipeline>,
    sink: Arc<dyn ConfigSink>,
    kinds: Mutex<Vec<KindEntry>>,
    watchers: Mutex<Vec<WatchHandle>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    resync_tx: mpsc::UnboundedSender<ResyncRequest>,
    resync_rx: Mutex<Option<mpsc::UnboundedReceiver<ResyncRequest>>>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    connected: AtomicBool,
}

impl K8sConfigClient {
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>, sink: Arc<dyn ConfigSink>) -> Self {
        Self::with_translator(options, transport, Arc::new(SchemaTranslator), sink)
    }

    pub fn with_translator(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        translator: Arc<dyn Translator>,
        sink: Arc<dyn ConfigSink>,
    ) -> Self {
        let pipeline = Arc::new(PartitionPipeline::new(options.pipeline_config(), translator, Arc::clone(&sink)));
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            root: options.api_root(),
            options,
            transport,
            pipeline,
            sink,
            kinds: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            resync_tx,
            resync_rx: Mutex::new(Some(resync_rx)),
            shutdown: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Connect to the configured server through kube.
    pub async fn connect(options: ClientOptions, sink: Arc<dyn ConfigSink>) -> ClientResult<Self> {
        let transport = KubeTransport::connect(&options.connect_options()).await?;
        Ok(Self::new(options, Arc::new(transport), sink))
    }

    /// Initialize and bulk sync, retrying the whole sequence until it
    /// succeeds, then start watching.
    pub async fn start(&self) -> ClientResult<()> {
        self.inner.initial_sync().await?;
        self.watch().await
    }

    /// Stop watchers, then the resync supervisor, then drain the pipeline.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.stop_watchers().await;
        let supervisor = inner.supervisor.lock().take();
        if let Some(h) = supervisor {
            if let Err(e) = h.await {
                warn!(error = %e, "resync supervisor ended abnormally");
            }
        }
        // A resync that was past its cancellation check may have restarted some.
        inner.stop_watchers().await;
        inner.pipeline.shutdown().await;
        info!("config client stopped");
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn kinds(&self) -> Vec<KindInfo> {
        self.inner.kinds.lock().iter().map(|k| k.info.clone()).collect()
    }

    /// Current watch cursor of a kind, by kind or resource name.
    pub fn cursor(&self, kind: &str) -> Option<String> {
        self.inner
            .kinds
            .lock()
            .iter()
            .find(|k| k.info.kind == kind || k.info.name == kind)
            .map(|k| k.cursor.get())
    }

    pub fn pipeline(&self) -> &Arc<PartitionPipeline> {
        &self.inner.pipeline
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_list_or_map_prop_empty(&self, uid: &Uid, property: &str) -> Option<bool> {
        self.inner.pipeline.is_list_or_map_prop_empty(uid, property)
    }
}

#[async_trait]
impl ConfigClient for K8sConfigClient {
    async fn init(&self) -> ClientResult<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ClientError::Stopped),
            r = self.inner.init() => r,
        }
    }

    async fn bulk_sync(&self) -> ClientResult<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ClientError::Stopped),
            r = self.inner.bulk_sync_all() => r.map(|_| ()),
        }
    }

    async fn watch(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if !inner.initialized.load(Ordering::Acquire) {
            return Err(ClientError::NotInitialized);
        }
        if inner.shutdown.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        if !inner.options.watch_enabled {
            info!("watch disabled by configuration");
            return Ok(());
        }
        inner.ensure_supervisor();
        if inner.watchers.lock().is_empty() {
            inner.start_watchers();
        }
        Ok(())
    }

    fn show_cache(&self, query: &CacheQuery) -> Vec<CacheEntrySummary> {
        self.inner.pipeline.show_cache(query)
    }
}

impl Inner {
    async fn init(&self) -> ClientResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        self.pipeline.start();
        let discovered = match discover_kinds(self.transport.as_ref(), &self.root, &self.options.kinds).await {
            Ok(k) => k,
            Err(e) => {
                self.set_connected(false, &e.to_string());
                return Err(e.into());
            }
        };
        {
            let mut kinds = self.kinds.lock();
            let previous = std::mem::take(&mut *kinds);
            *kinds = discovered
                .into_iter()
                .map(|info| {
                    let cursor = previous
                        .iter()
                        .find(|k| k.info.name == info.name)
                        .map(|k| k.cursor.clone())
                        .unwrap_or_default();
                    KindEntry { info, cursor }
                })
                .collect();
            info!(root = %self.root.root(), kinds = kinds.len(), "config client initialized");
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// List every kind; returns every identity seen.
    async fn bulk_sync_all(&self) -> ClientResult<HashSet<Uid>> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ClientError::NotInitialized);
        }
        let kinds = self.kinds.lock().clone();
        let mut seen = HashSet::new();
        for k in &kinds {
            let pipeline = &self.pipeline;
            let result = sync_kind(self.transport.as_ref(), &self.root, &k.info, self.options.fetch_limit(), |req| {
                seen.insert(req.uid.clone());
                pipeline.enqueue(req);
            })
            .await;
            match result {
                Ok(outcome) => {
                    k.cursor.set(outcome.cursor);
                    self.pipeline.wait_idle().await;
                    self.sink.on_bulk_sync_complete(&k.info.kind);
                }
                Err(e) => {
                    self.set_connected(false, &e.to_string());
                    return Err(e.into());
                }
            }
        }
        self.set_connected(true, "");
        Ok(seen)
    }

    async fn initial_sync(&self) -> ClientResult<()> {
        loop {
            let attempt = async {
                self.init().await?;
                self.bulk_sync_all().await?;
                Ok::<_, ClientError>(())
            };
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => Err(ClientError::Stopped),
                r = attempt => r,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(ClientError::Stopped) => return Err(ClientError::Stopped),
                Err(e) => {
                    warn!(
                        error = %e,
                        class = ?e.classify(),
                        delay_s = self.options.init_retry_delay_secs,
                        "initial sync failed; retrying whole client"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ClientError::Stopped),
                        _ = tokio::time::sleep(self.options.init_retry_delay()) => {}
                    }
                }
            }
        }
    }

    fn set_connected(&self, up: bool, error: &str) {
        let was = self.connected.swap(up, Ordering::AcqRel);
        if was == up {
            return;
        }
        if up {
            info!(root = %self.root.root(), "API server connection up");
        } else {
            warn!(root = %self.root.root(), error = %error, "API server connection down");
        }
    }

    fn start_watchers(&self) {
        let kinds = self.kinds.lock().clone();
        let mut handles = Vec::with_capacity(kinds.len());
        for k in kinds {
            let dispatcher: Arc<dyn Dispatcher> = self.pipeline.clone();
            handles.push(spawn_watch(WatchConfig {
                transport: Arc::clone(&self.transport),
                root: self.root.clone(),
                kind: k.info,
                cursor: k.cursor,
                dispatcher,
                resync_tx: self.resync_tx.clone(),
                retry_delay: self.options.watch_retry_delay(),
            }));
        }
        debug!(watchers = handles.len(), "watchers started");
        self.watchers.lock().extend(handles);
    }

    async fn stop_watchers(&self) {
        let handles = std::mem::take(&mut *self.watchers.lock());
        for h in handles {
            let kind = h.kind().to_string();
            let exit = h.stop().await;
            debug!(kind = %kind, exit = ?exit, "watcher stopped");
        }
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let Some(rx) = self.resync_rx.lock().take() else { return };
        let inner = Arc::clone(self);
        *supervisor = Some(tokio::spawn(inner.supervise(rx)));
    }

    async fn supervise(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ResyncRequest>) {
        loop {
            let req = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            if !self.resync(req, &mut rx).await {
                break;
            }
        }
        debug!("resync supervisor stopped");
    }

    /// Stop every watcher, re-list every kind, drop identities that vanished,
    /// restart the watchers. Returns false when interrupted by shutdown.
    async fn resync(&self, req: ResyncRequest, rx: &mut mpsc::UnboundedReceiver<ResyncRequest>) -> bool {
        metrics::counter!("resync_total", 1);
        warn!(kind = %req.kind, reason = %req.reason, "watch cursor lost; resyncing every kind");
        self.stop_watchers().await;
        while let Ok(extra) = rx.try_recv() {
            debug!(kind = %extra.kind, "resync request folded into the running resync");
        }

        let seen = loop {
            let listed = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                r = self.bulk_sync_all() => r,
            };
            match listed {
                Ok(seen) => break seen,
                Err(e) => {
                    warn!(error = %e, delay_s = self.options.init_retry_delay_secs, "resync listing failed; retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.options.init_retry_delay()) => {}
                    }
                }
            }
        };
        self.pipeline.sweep_absent(&seen);
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.start_watchers();
        info!(objects = seen.len(), "resync complete");
        true
    }
}
