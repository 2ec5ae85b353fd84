//! Transport boundary: plain GET and streaming GET against the API server.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use cfgsync_core::{Classify, FailureClass};
use futures::AsyncReadExt;
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self { status: 200, body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport config: {0}")]
    Config(String),
    #[error("connect: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("stream read: {0}")]
    Io(String),
}

impl Classify for TransportError {
    fn classify(&self) -> FailureClass {
        FailureClass::TransientRetry
    }
}

/// Returned by the byte callback of [`Transport::streaming_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// How a streaming GET ended without a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// The server ended the response.
    Closed,
    /// The cancel token fired.
    Cancelled,
    /// The byte callback asked to stop.
    Aborted,
    /// The server refused the request before streaming.
    Rejected { status: u16, body: Bytes },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError>;

    /// Deliver response bytes to `on_bytes` as they arrive, until the server
    /// closes, the callback stops, or `cancel` fires.
    async fn streaming_get(
        &self,
        path: &str,
        on_bytes: &mut (dyn for<'b> FnMut(&'b [u8]) -> StreamControl + Send),
        cancel: &CancellationToken,
    ) -> Result<StreamStatus, TransportError>;
}

/// Certificate type from the file extension, uppercased (`ca.pem` -> `PEM`).
/// Empty when the file has no extension.
pub fn cert_type(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_uppercase())
        .unwrap_or_default()
}

/// DER bodies of every `CERTIFICATE` block in a PEM bundle. Other blocks
/// (keys, CRLs) are skipped.
pub fn pem_to_der(pem: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Config(format!("PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Config("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Where and how to reach the API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Host or URL. `None` uses kubeconfig / in-cluster inference.
    pub server: Option<String>,
    pub port: u16,
    pub ca_cert: Option<PathBuf>,
}

impl ConnectOptions {
    fn cluster_url(&self, server: &str) -> String {
        if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("https://{}:{}", server, self.port)
        }
    }
}

fn load_root_certs(path: &Path) -> Result<Vec<Vec<u8>>, TransportError> {
    let raw = std::fs::read(path).map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?;
    match cert_type(path).as_str() {
        "DER" | "CER" => Ok(vec![raw]),
        _ => pem_to_der(&raw),
    }
}

/// [`Transport`] over a kube client.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(opts: &ConnectOptions) -> Result<Self, TransportError> {
        let mut config = match opts.server.as_deref() {
            Some(server) => {
                let url = opts.cluster_url(server);
                let uri: http::Uri = url.parse().map_err(|e| TransportError::Config(format!("{}: {}", url, e)))?;
                kube::Config::new(uri)
            }
            None => kube::Config::infer().await.map_err(|e| TransportError::Config(e.to_string()))?,
        };
        if let Some(path) = opts.ca_cert.as_deref() {
            config.root_cert = Some(load_root_certs(path)?);
            debug!(path = %path.display(), cert_type = %cert_type(path), "loaded root certificate");
        }
        // Watches are long-lived; the watcher decides when a stream is stale.
        config.read_timeout = None;
        let url = config.cluster_url.to_string();
        let client = Client::try_from(config).map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(server = %url, "kube transport ready");
        Ok(Self { client })
    }
}

/// Re-encode a kube API error as the `Status` body the server sent.
fn error_body(status: &str, message: &str, reason: &str, code: u16) -> Bytes {
    let status = serde_json::json!({
        "kind": "Status",
        "status": status,
        "message": message,
        "reason": reason,
        "code": code,
    });
    Bytes::from(status.to_string())
}

fn request(path: &str) -> Result<http::Request<Vec<u8>>, TransportError> {
    http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| TransportError::Request(format!("{}: {}", path, e)))
}

#[async_trait]
impl Transport for KubeTransport {
    async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
        match self.client.request_text(request(path)?).await {
            Ok(body) => Ok(HttpResponse::ok(body)),
            Err(kube::Error::Api(resp)) => Ok(HttpResponse { status: resp.code, body: error_body(&resp.status, &resp.message, &resp.reason, resp.code) }),
            Err(e) => Err(TransportError::Request(e.to_string())),
        }
    }

    async fn streaming_get(
        &self,
        path: &str,
        on_bytes: &mut (dyn for<'b> FnMut(&'b [u8]) -> StreamControl + Send),
        cancel: &CancellationToken,
    ) -> Result<StreamStatus, TransportError> {
        let req = request(path)?;
        let reader = tokio::select! {
            _ = cancel.cancelled() => return Ok(StreamStatus::Cancelled),
            r = self.client.request_stream(req) => match r {
                Ok(reader) => reader,
                Err(kube::Error::Api(resp)) => {
                    return Ok(StreamStatus::Rejected { status: resp.code, body: error_body(&resp.status, &resp.message, &resp.reason, resp.code) })
                }
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            },
        };
        futures::pin_mut!(reader);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamStatus::Cancelled),
                n = reader.read(&mut buf) => match n {
                    Ok(0) => return Ok(StreamStatus::Closed),
                    Ok(n) => {
                        if on_bytes(&buf[..n]) == StreamControl::Stop {
                            return Ok(StreamStatus::Aborted);
                        }
                    }
                    Err(e) => return Err(TransportError::Io(e.to_string())),
                },
            }
        }
    }
}
