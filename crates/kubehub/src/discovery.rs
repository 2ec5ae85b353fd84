use cfgsync_core::KindInfo;
use serde::Deserialize;
use tracing::{debug, info};

use crate::bulk::SyncError;
use crate::paths::ApiRoot;
use crate::transport::Transport;

#[derive(Deserialize)]
struct ResourceList {
    #[serde(default)]
    resources: Vec<KindInfo>,
}

/// Kinds served under `root`, minus `/status` subresources. When `allow` is
/// non-empty only kinds whose resource name or kind matches (case-insensitive)
/// are kept.
pub async fn discover_kinds(
    transport: &dyn Transport,
    root: &ApiRoot,
    allow: &[String],
) -> Result<Vec<KindInfo>, SyncError> {
    let path = root.root();
    let resp = transport.get(&path).await?;
    if !resp.is_success() {
        return Err(SyncError::Status { path, status: resp.status, body: resp.body_text() });
    }
    let list: ResourceList =
        serde_json::from_slice(&resp.body).map_err(|e| SyncError::Parse { path: path.clone(), reason: e.to_string() })?;

    let mut kinds = Vec::with_capacity(list.resources.len());
    for k in list.resources {
        if k.is_status_subresource() {
            continue;
        }
        let allowed = allow.is_empty()
            || allow.iter().any(|a| a.eq_ignore_ascii_case(&k.name) || a.eq_ignore_ascii_case(&k.kind));
        if !allowed {
            debug!(kind = %k.kind, "kind not in allow-list; skipped");
            continue;
        }
        kinds.push(k);
    }
    info!(root = %path, kinds = kinds.len(), "discovered kinds");
    Ok(kinds)
}
