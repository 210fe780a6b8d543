//! # Diagnostics HTTP API
//!
//! Read-only HTTP surface over the networking facade for operators and the
//! `status` subcommand:
//!
//! | Route          | Description                                   |
//! |----------------|-----------------------------------------------|
//! | `/status`      | Node summary: version, peer ID, uptime, counts |
//! | `/protocols`   | Registered protocol snapshots                  |
//! | `/topics`      | Subscribed topic snapshots                     |
//! | `/negotiator`  | Per-peer protocol preferences + counters       |
//! | `/diagnostics` | The full diagnostics snapshot                  |
//!
//! Everything here is a serialized view of facade state; the API holds no
//! state of its own and mutates nothing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use arclight_net::facade::Network;

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Human-readable build/version string.
    pub version: String,
    /// The networking facade this API reports on.
    pub network: Arc<Network>,
    /// Unix milliseconds when the node came up.
    pub started_at_ms: u64,
}

/// Builds the diagnostics router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/protocols", get(protocols))
        .route("/topics", get(topics))
        .route("/negotiator", get(negotiator))
        .route("/diagnostics", get(diagnostics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let diag = state.network.diagnostics();
    let uptime_ms = now_ms().saturating_sub(state.started_at_ms);
    Json(json!({
        "version": state.version,
        "peer_id": diag.local_peer,
        "uptime_ms": uptime_ms,
        "protocols": diag.protocols.len(),
        "topics": diag.topics.len(),
        "maintenance_rounds": diag.maintainer.rounds,
    }))
}

async fn protocols(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "protocols": state.network.protocols() }))
}

async fn topics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let diag = state.network.diagnostics();
    Json(json!({
        "topics": diag.topics,
        "publish_stats": diag.publish_stats,
    }))
}

async fn negotiator(State(state): State<AppState>) -> Json<serde_json::Value> {
    let diag = state.network.diagnostics();
    Json(json!({
        "stats": diag.negotiator,
        "preferences": diag.preferences,
    }))
}

async fn diagnostics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.network.diagnostics()).unwrap_or_else(|e| {
        json!({ "error": format!("diagnostics serialization failed: {}", e) })
    }))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
