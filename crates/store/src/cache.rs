use std::collections::BTreeMap;
use std::time::Duration;

use cfgsync_core::{ProcessRequest, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::time::delay_queue;

/// Capped exponential backoff for per-identity retries:
/// `min(min_ms * 2^min(retry_count, max_pow), cap_ms)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_ms: u64,
    pub max_pow: u32,
    pub cap_ms: u64,
}

impl RetryPolicy {
    pub const DEFAULT_MIN_MS: u64 = 100;
    pub const DEFAULT_MAX_POW: u32 = 20;

    pub fn delay(&self, retry_count: u32) -> Duration {
        let pow = retry_count.min(self.max_pow).min(63);
        let ms = self.min_ms.saturating_mul(1u64 << pow);
        Duration::from_millis(ms.min(self.cap_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_ms: Self::DEFAULT_MIN_MS,
            max_pow: Self::DEFAULT_MAX_POW,
            cap_ms: Self::DEFAULT_MIN_MS << Self::DEFAULT_MAX_POW,
        }
    }
}

/// An armed retry: the timer key plus the request it re-drives.
pub(crate) struct PendingRetry {
    pub key: delay_queue::Key,
    pub req: ProcessRequest,
}

/// Per-identity state, owned by exactly one partition task.
pub(crate) struct CacheEntry {
    /// Last successfully applied raw object.
    pub raw: Option<serde_json::Value>,
    /// Canonical record emitted for `raw`.
    pub record: Option<serde_json::Value>,
    pub retry_count: u32,
    pub retry: Option<PendingRetry>,
    pub last_read: DateTime<Utc>,
    pub empty_props: BTreeMap<String, bool>,
}

impl CacheEntry {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            raw: None,
            record: None,
            retry_count: 0,
            retry: None,
            last_read: now,
            empty_props: BTreeMap::new(),
        }
    }

    pub fn summarize(&self, uid: &Uid, partition: usize) -> CacheEntrySummary {
        let field = |name: &str| {
            self.record
                .as_ref()
                .and_then(|r| r.get(name))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        CacheEntrySummary {
            uid: uid.clone(),
            partition,
            kind: field("type"),
            name: field("name"),
            last_read: self.last_read.to_rfc3339(),
            retry_count: self.retry_count,
            retry_armed: self.retry.is_some(),
            json: self.raw.as_ref().map(|v| v.to_string()),
            empty_props: self.empty_props.clone(),
        }
    }
}

/// Read-only view of a cache entry for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheEntrySummary {
    pub uid: Uid,
    pub partition: usize,
    /// Canonical type of the last applied record.
    pub kind: Option<String>,
    pub name: Option<String>,
    pub last_read: String,
    pub retry_count: u32,
    pub retry_armed: bool,
    /// Last applied raw JSON.
    pub json: Option<String>,
    pub empty_props: BTreeMap<String, bool>,
}

/// Paginated cache query: entries strictly after `after`, matching `search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheQuery {
    /// Substring matched against uid, type and name. Empty matches all.
    pub search: String,
    pub after: Option<String>,
    /// 0 selects the default page size.
    pub limit: usize,
    pub partition: Option<usize>,
}

impl CacheQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 10_000;

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        }
    }

    pub fn matches(&self, s: &CacheEntrySummary) -> bool {
        if self.search.is_empty() {
            return true;
        }
        s.uid.as_str().contains(&self.search)
            || s.kind.as_deref().map_or(false, |k| k.contains(&self.search))
            || s.name.as_deref().map_or(false, |n| n.contains(&self.search))
    }
}
