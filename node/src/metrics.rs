//! # Prometheus Metrics
//!
//! Exposes operational metrics for the node's networking stack. Scraped by
//! Prometheus at the `/metrics` HTTP endpoint on the configured metrics
//! port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so
//! they do not collide with any default global registry consumers. Values
//! are gauges refreshed from the facade's diagnostics snapshot by a sampler
//! task — the networking core itself knows nothing about Prometheus.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use arclight_net::facade::Diagnostics;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (wraps `Arc` internally via prometheus handles) so it can
/// be shared across request handlers and background tasks.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Number of registered protocol IDs (both namespace forms counted).
    pub registered_protocols: IntGauge,
    /// Number of currently subscribed topics.
    pub subscribed_topics: IntGauge,
    /// Messages accepted by the publish path, across all topics.
    pub messages_published: IntGauge,
    /// Messages dropped by the publish path, across all topics.
    pub messages_dropped: IntGauge,
    /// Maintenance dials that connected.
    pub dials_succeeded: IntGauge,
    /// Maintenance dials that failed or timed out.
    pub dials_failed: IntGauge,
    /// Entries currently held in the pubsub dedup cache.
    pub dedup_entries: IntGauge,
    /// Calls that skipped protocol probing thanks to a cached preference.
    pub avoided_fallbacks: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("arclight".into()), None)
            .expect("failed to create prometheus registry");

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::new(name, help).expect("metric creation");
            registry.register(Box::new(g.clone())).expect("metric registration");
            g
        }

        Self {
            registered_protocols: gauge(
                &registry,
                "registered_protocols",
                "Number of registered protocol IDs",
            ),
            subscribed_topics: gauge(
                &registry,
                "subscribed_topics",
                "Number of currently subscribed pubsub topics",
            ),
            messages_published: gauge(
                &registry,
                "messages_published",
                "Messages accepted by the publish path",
            ),
            messages_dropped: gauge(
                &registry,
                "messages_dropped",
                "Messages dropped by the publish path",
            ),
            dials_succeeded: gauge(
                &registry,
                "maintenance_dials_succeeded",
                "Maintenance dials that connected",
            ),
            dials_failed: gauge(
                &registry,
                "maintenance_dials_failed",
                "Maintenance dials that failed or timed out",
            ),
            dedup_entries: gauge(
                &registry,
                "dedup_cache_entries",
                "Entries currently in the pubsub dedup cache",
            ),
            avoided_fallbacks: gauge(
                &registry,
                "negotiator_avoided_fallbacks",
                "Calls that skipped protocol probing via a cached preference",
            ),
            registry,
        }
    }

    /// Refresh every gauge from a diagnostics snapshot.
    pub fn update_from(&self, diag: &Diagnostics) {
        self.registered_protocols.set(diag.protocols.len() as i64);
        self.subscribed_topics.set(diag.topics.len() as i64);

        let (published, dropped) = diag
            .publish_stats
            .iter()
            .fold((0i64, 0i64), |(p, d), (_, stats)| {
                (p + stats.published as i64, d + stats.dropped as i64)
            });
        self.messages_published.set(published);
        self.messages_dropped.set(dropped);

        self.dials_succeeded.set(diag.maintainer.dials_succeeded as i64);
        self.dials_failed.set(diag.maintainer.dials_failed as i64);
        self.dedup_entries.set(diag.validator.dedup_entries as i64);
        self.avoided_fallbacks.set(diag.negotiator.avoided_fallbacks as i64);
    }

    /// Encodes all registered metrics into the Prometheus text exposition
    /// format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers via extension.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
