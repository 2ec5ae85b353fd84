//! cfgsync kubehub: the API-server side of ingestion.
//!
//! Discovery of served kinds, the paginated bulk synchronizer and the per-kind
//! watch reconciler, all over a small [`Transport`] boundary backed by kube.

#![forbid(unsafe_code)]

mod bulk;
mod discovery;
mod paths;
mod transport;
mod watch;

#[cfg(feature = "testing")]
pub mod testing;

pub use bulk::{sync_kind, BulkOutcome, SyncError};
pub use discovery::discover_kinds;
pub use paths::ApiRoot;
pub use transport::{
    cert_type, pem_to_der, ConnectOptions, HttpResponse, KubeTransport, StreamControl, StreamStatus, Transport,
    TransportError,
};
pub use watch::{
    classify_error_object, spawn_watch, KindCursor, ResyncRequest, WatchConfig, WatchExit, WatchFailure, WatchHandle,
    WatchState,
};
