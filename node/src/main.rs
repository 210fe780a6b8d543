// Copyright (c) 2026 Arclight Labs. MIT License.
// See LICENSE for details.

//! # Arclight Node
//!
//! Entry point for the `arclight-node` binary. Parses CLI arguments,
//! initializes logging and metrics, wires the networking facade over the
//! in-process substrate, and serves the diagnostics API.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the node
//! - `status`  — query a running node's status endpoint
//! - `version` — print build version information
//!
//! In this standalone configuration the facade runs over the in-process
//! substrate with a built-in ping protocol and telemetry heartbeat topic,
//! which exercises the full stack (registry, stream transport, pubsub
//! pipeline, maintainer) on a single node. Wiring a production P2P host in
//! its place is a matter of implementing the two substrate traits.

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use arclight_net::facade::Network;
use arclight_net::maintain::TriggerReason;
use arclight_net::registry::ProtocolHandler;
use arclight_net::substrate::memory::MemoryHub;
use arclight_net::substrate::PeerId;
use arclight_net::topic::Topic;
use arclight_net::{NetworkConfig, PublishOptions, TopicHandler, TopicRules};

use cli::{ArclightNodeCli, Commands};
use logging::LogFormat;
use metrics::NodeMetrics;

/// How often the sampler refreshes Prometheus gauges from diagnostics.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ArclightNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: networking facade, demo protocol/topic wiring,
/// diagnostics API, and metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "arclight_node=info,arclight_net=info,tower_http=debug",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        namespace = args.namespace.as_deref().unwrap_or("<none>"),
        "starting arclight-node"
    );

    // --- Networking facade over the in-process substrate ---
    let hub = MemoryHub::new();
    let (host, mesh) = hub.add_node("local");
    let cfg = NetworkConfig {
        namespace: args.namespace.clone(),
        ..NetworkConfig::default()
    };
    let network = Network::new(cfg, host, mesh);
    network.update_maintenance_peers(
        args.business_peers.iter().map(|p| PeerId::new(p.clone())).collect(),
        args.bootstrap_peers.iter().map(|p| PeerId::new(p.clone())).collect(),
    );
    network.start().await;

    // --- Built-in ping protocol ---
    let ping: ProtocolHandler = Arc::new(|peer, _payload| {
        Box::pin(async move {
            tracing::debug!(peer = %peer, "ping received");
            Ok(Bytes::from_static(b"pong"))
        })
    });
    network
        .register_protocol("/arc/ping/1.0.0", ping)
        .context("failed to register ping protocol")?;

    // --- Telemetry heartbeat topic ---
    let heartbeat_topic = Topic::new("telemetry", "heartbeat", "v1");
    let on_heartbeat: TopicHandler = Arc::new(|peer, payload| {
        Box::pin(async move {
            tracing::debug!(peer = %peer, bytes = payload.len(), "heartbeat received");
            Ok(())
        })
    });
    network
        .subscribe(&heartbeat_topic, TopicRules::default(), on_heartbeat)
        .await
        .context("failed to subscribe heartbeat topic")?;

    let publisher = Arc::clone(&network);
    let topic = heartbeat_topic.clone();
    let heartbeat_secs = args.heartbeat_secs.max(1);
    let heartbeat_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_secs));
        let mut seq: u64 = 0;
        loop {
            interval.tick().await;
            seq += 1;
            let payload = format!("heartbeat {} at {}", seq, chrono::Utc::now().to_rfc3339());
            if let Err(e) = publisher
                .publish(&topic, Bytes::from(payload), PublishOptions::default())
                .await
            {
                tracing::warn!(error = %e, "heartbeat publish failed");
            }
        }
    });

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let sampler_metrics = Arc::clone(&node_metrics);
    let sampler_network = Arc::clone(&network);
    let sampler = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            sampler_metrics.update_from(&sampler_network.diagnostics());
        }
    });

    // --- Diagnostics API ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: Arc::clone(&network),
        started_at_ms: chrono::Utc::now().timestamp_millis() as u64,
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("diagnostics API listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // Kick an initial maintenance round now that peer lists are installed.
    network.trigger_maintenance(TriggerReason::Startup);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    heartbeat_loop.abort();
    sampler.abort();
    network.stop().await;
    tracing::info!("arclight-node stopped");
    Ok(())
}

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    println!("{}", body);
    Ok(())
}

/// Minimal HTTP GET without pulling in a client crate.
/// In a real deployment, swap this for a proper HTTP client.
async fn http_get(url: &str) -> Result<String> {
    let parsed: url::Url = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid URL: {}", e))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("missing host in URL"))?;
    let port = parsed.port().unwrap_or(80);
    let path = parsed.path();

    let addr = format!("{}:{}", host, port);
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host,
    );

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Strip HTTP headers — everything after the first blank line is the body.
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string());

    Ok(body)
}

/// Prints version information to stdout.
fn print_version() {
    println!("arclight-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Minimal URL parser — just enough to extract host/port/path.
/// Avoids pulling in the `url` crate for a single use.
mod url {
    pub struct Url {
        host: String,
        port: Option<u16>,
        path: String,
    }

    impl Url {
        pub fn host_str(&self) -> Option<&str> {
            Some(&self.host)
        }

        pub fn port(&self) -> Option<u16> {
            self.port
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl std::str::FromStr for Url {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            // Strip scheme.
            let rest = s
                .strip_prefix("http://")
                .or_else(|| s.strip_prefix("https://"))
                .unwrap_or(s);

            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };

            let (host, port) = match authority.rfind(':') {
                Some(i) => {
                    let p = authority[i + 1..]
                        .parse::<u16>()
                        .map_err(|e| format!("bad port: {}", e))?;
                    (authority[..i].to_string(), Some(p))
                }
                None => (authority.to_string(), None),
            };

            Ok(Url {
                host,
                port,
                path: path.to_string(),
            })
        }
    }
}
