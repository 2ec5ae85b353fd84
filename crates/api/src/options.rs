use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cfgsync_kubehub::{ApiRoot, ConnectOptions};
use cfgsync_store::{PipelineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Client configuration. Every field has a default; `from_env` overlays
/// `CFGSYNC_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// API server host or URL; `None` uses kubeconfig / in-cluster config.
    pub server: Option<String>,
    pub port: u16,
    /// Root certificate; its type comes from the file extension.
    pub ca_cert: Option<PathBuf>,
    pub api_group: String,
    pub api_version: String,
    /// Kinds to watch by resource name or kind; empty watches every discovered kind.
    pub kinds: Vec<String>,
    pub fetch_limit: u32,
    pub partitions: usize,
    pub retry_min_ms: u64,
    pub retry_max_pow: u32,
    /// Defaults to `retry_min_ms << retry_max_pow`.
    pub retry_cap_ms: Option<u64>,
    pub watch_retry_delay_secs: u64,
    pub init_retry_delay_secs: u64,
    pub watch_enabled: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: None,
            port: 6443,
            ca_cert: None,
            api_group: "core.cfgsync.io".into(),
            api_version: "v1".into(),
            kinds: Vec::new(),
            fetch_limit: 500,
            partitions: 4,
            retry_min_ms: RetryPolicy::DEFAULT_MIN_MS,
            retry_max_pow: RetryPolicy::DEFAULT_MAX_POW,
            retry_cap_ms: None,
            watch_retry_delay_secs: 5,
            init_retry_delay_secs: 5,
            watch_enabled: true,
        }
    }
}

fn env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ClientOptions {
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(v) = std::env::var("CFGSYNC_SERVER").ok().filter(|s| !s.is_empty()) {
            o.server = Some(v);
        }
        if let Some(v) = env("CFGSYNC_PORT") {
            o.port = v;
        }
        if let Some(v) = std::env::var("CFGSYNC_CA_CERT").ok().filter(|s| !s.is_empty()) {
            o.ca_cert = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("CFGSYNC_API_GROUP") {
            o.api_group = v;
        }
        if let Some(v) = std::env::var("CFGSYNC_API_VERSION").ok().filter(|s| !s.is_empty()) {
            o.api_version = v;
        }
        if let Ok(v) = std::env::var("CFGSYNC_KINDS") {
            o.kinds = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        if let Some(v) = env("CFGSYNC_FETCH_LIMIT") {
            o.fetch_limit = v;
        }
        if let Some(v) = env("CFGSYNC_PARTITIONS") {
            o.partitions = v;
        }
        if let Some(v) = env("CFGSYNC_RETRY_MIN_MS") {
            o.retry_min_ms = v;
        }
        if let Some(v) = env("CFGSYNC_RETRY_MAX_POW") {
            o.retry_max_pow = v;
        }
        if let Some(v) = env("CFGSYNC_RETRY_CAP_MS") {
            o.retry_cap_ms = Some(v);
        }
        if let Some(v) = env("CFGSYNC_WATCH_RETRY_SECS") {
            o.watch_retry_delay_secs = v;
        }
        if let Some(v) = env("CFGSYNC_INIT_RETRY_SECS") {
            o.init_retry_delay_secs = v;
        }
        if let Some(v) = env_bool("CFGSYNC_WATCH_ENABLED") {
            o.watch_enabled = v;
        }
        o
    }

    pub fn api_root(&self) -> ApiRoot {
        ApiRoot::new(self.api_group.clone(), self.api_version.clone())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions { server: self.server.clone(), port: self.port, ca_cert: self.ca_cert.clone() }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let pow = self.retry_max_pow.min(63);
        let default_cap = self.retry_min_ms.saturating_mul(1u64 << pow);
        RetryPolicy {
            min_ms: self.retry_min_ms,
            max_pow: pow,
            cap_ms: self.retry_cap_ms.unwrap_or(default_cap),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig { partitions: self.partitions.max(1), retry: self.retry_policy() }
    }

    pub fn fetch_limit(&self) -> u32 {
        self.fetch_limit.max(1)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_secs(self.watch_retry_delay_secs)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_secs(self.init_retry_delay_secs)
    }
}
