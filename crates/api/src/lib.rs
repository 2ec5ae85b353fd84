//! cfgsync public API façade.
//!
//! Frontends depend on the [`ConfigClient`] capability set. The Kubernetes
//! flavour, [`K8sConfigClient`], wires discovery, bulk sync and per-kind
//! watchers into the partition pipeline and supervises full resyncs.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use cfgsync_core::{Classify, FailureClass};
use cfgsync_kubehub::{SyncError, TransportError};

mod client;
mod options;

pub use cfgsync_store::{CacheEntrySummary, CacheQuery};
pub use client::K8sConfigClient;
pub use options::ClientOptions;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("client is not initialized")]
    NotInitialized,
    #[error("client is stopped")]
    Stopped,
}

impl Classify for ClientError {
    fn classify(&self) -> FailureClass {
        match self {
            ClientError::Transport(e) => e.classify(),
            ClientError::Sync(e) => e.classify(),
            ClientError::NotInitialized | ClientError::Stopped => FailureClass::TransientRetry,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Capabilities every config ingestion client offers.
#[async_trait]
pub trait ConfigClient: Send + Sync {
    /// Resolve the kinds to ingest and start the processing pipeline.
    async fn init(&self) -> ClientResult<()>;

    /// List every kind once, feeding all objects into the pipeline and
    /// recording each kind's watch cursor.
    async fn bulk_sync(&self) -> ClientResult<()>;

    /// Start one watcher per kind from its recorded cursor.
    async fn watch(&self) -> ClientResult<()>;

    /// Diagnostic view of the per-identity cache.
    fn show_cache(&self, query: &CacheQuery) -> Vec<CacheEntrySummary>;
}
