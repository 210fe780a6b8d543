//! # Publish Statistics & Delivery Helper
//!
//! Per-topic counters for the publish path (accepted, dropped, bytes out)
//! and the deadline-aware broadcast helper the pubsub transport sends
//! through. Broadcast has no delivery acknowledgement — these counters are
//! the only publish-side observability there is.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::error::NetError;
use crate::substrate::MeshNetwork;
use crate::wire::envelope::unix_millis;

/// Counters for one topic's publish activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicStats {
    pub published: u64,
    pub dropped: u64,
    pub bytes_out: u64,
    pub last_publish_ms: u64,
}

/// Per-topic publish statistics, plus the deadline-aware send helper.
#[derive(Default)]
pub struct Publisher {
    stats: DashMap<String, TopicStats>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast with a deadline. A mesh primitive that blocks past the
    /// deadline turns into a timeout error rather than a stuck publisher.
    pub async fn broadcast(
        &self,
        mesh: &Arc<dyn MeshNetwork>,
        topic: &str,
        data: Bytes,
        deadline: Duration,
    ) -> Result<(), NetError> {
        let len = data.len() as u64;
        match tokio::time::timeout(deadline, mesh.broadcast(topic, data)).await {
            Ok(Ok(())) => {
                self.record_publish(topic, len);
                Ok(())
            }
            Ok(Err(e)) => {
                self.record_drop(topic);
                Err(e)
            }
            Err(_) => {
                self.record_drop(topic);
                Err(NetError::Timeout {
                    phase: "broadcast",
                    timeout: deadline,
                })
            }
        }
    }

    pub fn record_publish(&self, topic: &str, bytes: u64) {
        let mut stats = self.stats.entry(topic.to_string()).or_default();
        stats.published += 1;
        stats.bytes_out += bytes;
        stats.last_publish_ms = unix_millis();
    }

    pub fn record_drop(&self, topic: &str) {
        self.stats.entry(topic.to_string()).or_default().dropped += 1;
    }

    pub fn topic_stats(&self, topic: &str) -> Option<TopicStats> {
        self.stats.get(topic).map(|s| s.clone())
    }

    /// Snapshot of every topic's counters, sorted by topic.
    pub fn snapshot(&self) -> Vec<(String, TopicStats)> {
        let mut all: Vec<(String, TopicStats)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
