//! # CLI Interface
//!
//! Defines the command-line argument structure for `arclight-node` using
//! `clap` derive. Supports three subcommands: `run`, `status`, and
//! `version`.

use clap::{Parser, Subcommand};

/// Arclight network node.
///
/// Runs the Arclight networking stack: protocol registry, request/response
/// streaming, gossip pubsub, connection maintenance, a diagnostics API, and
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "arclight-node",
    about = "Arclight network node",
    version,
    propagate_version = true
)]
pub struct ArclightNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Arclight node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Query the status of a running node via its diagnostics endpoint.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Port for the diagnostics HTTP API.
    #[arg(long, env = "ARCLIGHT_API_PORT", default_value_t = 9610)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ARCLIGHT_METRICS_PORT", default_value_t = 9611)]
    pub metrics_port: u16,

    /// Deployment namespace applied to protocol IDs and topics
    /// (e.g. "testnet-7"). Omit to run unqualified.
    #[arg(long, env = "ARCLIGHT_NAMESPACE")]
    pub namespace: Option<String>,

    /// Business-critical peers the maintainer must keep connected.
    /// Repeatable.
    #[arg(long = "business-peer", env = "ARCLIGHT_BUSINESS_PEERS", value_delimiter = ',')]
    pub business_peers: Vec<String>,

    /// Bootstrap peers for mesh attachment. Repeatable.
    #[arg(long = "bootstrap-peer", env = "ARCLIGHT_BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peers: Vec<String>,

    /// Seconds between heartbeat publishes on the telemetry topic.
    #[arg(long, env = "ARCLIGHT_HEARTBEAT_SECS", default_value_t = 10)]
    pub heartbeat_secs: u64,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "ARCLIGHT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Diagnostics endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:9610")]
    pub api_url: String,
}
