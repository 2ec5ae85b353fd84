use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cfgsync_api::{CacheQuery, ClientOptions, ConfigClient, K8sConfigClient};
use cfgsync_core::{ConfigSink, Operation, Uid};
use cfgsync_store::MemorySink;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cfgsyncctl", version, about = "cfgsync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// API server host or URL (default: kubeconfig / in-cluster)
    #[arg(long, global = true)]
    server: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    /// Root certificate (.pem or .der)
    #[arg(long = "ca-cert", global = true)]
    ca_cert: Option<PathBuf>,

    /// API group serving the config kinds
    #[arg(long = "api-group", global = true)]
    api_group: Option<String>,

    /// Comma separated kinds to ingest (default: all discovered)
    #[arg(long, global = true, value_delimiter = ',')]
    kinds: Vec<String>,

    #[arg(long, global = true)]
    partitions: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover the config kinds served by the API group
    Kinds,
    /// Bulk sync, then watch and print applied records until Ctrl-C
    Sync {
        /// Stop after the bulk sync
        #[arg(long = "no-watch", action = ArgAction::SetTrue)]
        no_watch: bool,
    },
    /// Bulk sync once and print the per-object cache
    Cache {
        /// Substring matched against uid, type and name
        #[arg(long, default_value = "")]
        search: String,
        /// Only entries after this uid
        #[arg(long)]
        after: Option<String>,
        #[arg(long, default_value_t = CacheQuery::DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long)]
        partition: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("CFGSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CFGSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CFGSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    /// Environment first, then flags.
    fn options(&self) -> ClientOptions {
        let mut o = ClientOptions::from_env();
        if let Some(s) = &self.server {
            o.server = Some(s.clone());
        }
        if let Some(p) = self.port {
            o.port = p;
        }
        if let Some(c) = &self.ca_cert {
            o.ca_cert = Some(c.clone());
        }
        if let Some(g) = &self.api_group {
            o.api_group = g.clone();
        }
        if !self.kinds.is_empty() {
            o.kinds = self.kinds.clone();
        }
        if let Some(p) = self.partitions {
            o.partitions = p;
        }
        o
    }
}

/// Prints every applied record on stdout.
struct PrintSink {
    output: Output,
}

impl ConfigSink for PrintSink {
    fn on_object(&self, uid: &Uid, record: &serde_json::Value, op: Operation) {
        match self.output {
            Output::Human => match op {
                Operation::Delete => println!("- {}", uid),
                _ => {
                    let ty = record.get("type").and_then(|v| v.as_str()).unwrap_or("-");
                    let name = record.get("name").and_then(|v| v.as_str()).unwrap_or("-");
                    println!("+ {} {} {}", uid, ty, name);
                }
            },
            Output::Json => {
                let line = serde_json::json!({ "op": op, "uid": uid.to_string(), "record": record });
                println!("{}", line);
            }
        }
    }

    fn on_bulk_sync_complete(&self, kind: &str) {
        info!(kind = %kind, "bulk sync complete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let options = cli.options();

    match cli.command {
        Commands::Kinds => {
            let client = K8sConfigClient::connect(options, Arc::new(MemorySink::new()))
                .await
                .context("connecting to API server")?;
            client.init().await.context("discovering kinds")?;
            let kinds = client.kinds();
            match cli.output {
                Output::Human => {
                    println!("{:<28} {:<24} SCOPE", "NAME", "KIND");
                    for k in &kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<28} {:<24} {}", k.name, k.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
            client.shutdown().await;
        }
        Commands::Sync { no_watch } => {
            let mut options = options;
            if no_watch {
                options.watch_enabled = false;
            }
            let sink = Arc::new(PrintSink { output: cli.output });
            let client = K8sConfigClient::connect(options, sink).await.context("connecting to API server")?;
            tokio::select! {
                res = client.start() => res.context("starting config client")?,
                _ = signal::ctrl_c() => {
                    info!("interrupted during initial sync");
                    client.shutdown().await;
                    return Ok(());
                }
            }
            if !no_watch {
                info!(kinds = client.kinds().len(), "watching; Ctrl-C to stop");
                signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            }
            client.shutdown().await;
        }
        Commands::Cache { search, after, limit, partition } => {
            let client = K8sConfigClient::connect(options, Arc::new(MemorySink::new()))
                .await
                .context("connecting to API server")?;
            client.init().await.context("discovering kinds")?;
            client.bulk_sync().await.context("bulk sync")?;
            let entries = client.show_cache(&CacheQuery { search, after, limit, partition });
            match cli.output {
                Output::Human => {
                    println!("{:<38} {:<4} {:<24} {:<24} RETRIES", "UID", "PART", "TYPE", "NAME");
                    for e in &entries {
                        println!(
                            "{:<38} {:<4} {:<24} {:<24} {}{}",
                            e.uid.to_string(),
                            e.partition,
                            e.kind.as_deref().unwrap_or("-"),
                            e.name.as_deref().unwrap_or("-"),
                            e.retry_count,
                            if e.retry_armed { " (armed)" } else { "" }
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            }
            client.shutdown().await;
        }
    }
    Ok(())
}
