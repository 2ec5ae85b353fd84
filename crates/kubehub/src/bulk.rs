//! Bulk synchronizer: paginated full listing of one kind.

use cfgsync_core::{Classify, FailureClass, KindInfo, Operation, ProcessRequest, Uid};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::paths::ApiRoot;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("GET {path} returned {status}: {body}")]
    Status { path: String, status: u16, body: String },
    #[error("GET {path}: malformed response: {reason}")]
    Parse { path: String, reason: String },
}

impl Classify for SyncError {
    /// A failed listing is retried as part of a whole-client initialization.
    fn classify(&self) -> FailureClass {
        FailureClass::TransientRetry
    }
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    metadata: ListMeta,
}

/// Result of a completed listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// resourceVersion of the final page; the watch starts here.
    pub cursor: String,
    pub objects: usize,
    pub pages: usize,
}

/// List every object of `kind`, `limit` per page, handing each to `on_object`
/// in page order. Any failure aborts the listing.
pub async fn sync_kind<F>(
    transport: &dyn Transport,
    root: &ApiRoot,
    kind: &KindInfo,
    limit: u32,
    mut on_object: F,
) -> Result<BulkOutcome, SyncError>
where
    F: FnMut(ProcessRequest) + Send,
{
    let mut outcome = BulkOutcome::default();
    let mut token: Option<String> = None;
    loop {
        let path = root.list(&kind.name, limit, token.as_deref());
        let resp = transport.get(&path).await?;
        if !resp.is_success() {
            return Err(SyncError::Status { path, status: resp.status, body: resp.body_text() });
        }
        let page: ListPage =
            serde_json::from_slice(&resp.body).map_err(|e| SyncError::Parse { path: path.clone(), reason: e.to_string() })?;
        outcome.pages += 1;
        debug!(kind = %kind.kind, page = outcome.pages, items = page.items.len(), "list page");

        for mut item in page.items {
            let uid = item
                .pointer("/metadata/uid")
                .and_then(Value::as_str)
                .map(Uid::parse)
                .ok_or_else(|| SyncError::Parse { path: path.clone(), reason: "item without metadata.uid".into() })?;
            // List items omit their kind.
            if let Some(obj) = item.as_object_mut() {
                obj.entry("kind").or_insert_with(|| Value::String(kind.kind.clone()));
            }
            on_object(ProcessRequest::new(Operation::Create, uid, item));
            outcome.objects += 1;
        }

        match page.metadata.continue_.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => {
                outcome.cursor = page.metadata.resource_version.unwrap_or_default();
                break;
            }
        }
    }
    metrics::counter!("bulk_sync_objects_total", outcome.objects as u64, "kind" => kind.kind.clone());
    info!(kind = %kind.kind, objects = outcome.objects, pages = outcome.pages, rv = %outcome.cursor, "bulk sync complete");
    Ok(outcome)
}
