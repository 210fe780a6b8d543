//! # Topics & Subscription Bookkeeping
//!
//! A topic is a structured name rendered to the dotted string the mesh
//! primitive actually sees: `arc.[namespace.]domain.name.version`. The
//! namespace segment is applied by a pure, idempotent transform — qualifying
//! an already-qualified topic is a no-op, which is the whole defense against
//! the double-qualification bug class (one code path qualifies on publish,
//! another on subscribe, and suddenly nobody is on the same topic).
//!
//! [`TopicManager`] owns the subscription refcounts. Topic state exists
//! while at least one handler holds a reference and is removed exactly when
//! the count returns to zero. Counts never go negative; unsubscribing an
//! absent topic is a no-op.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::TOPIC_ORG;
use crate::error::NetError;
use crate::wire::envelope::unix_millis;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Structured topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    /// Deployment namespace segment, when qualified.
    pub namespace: Option<String>,
    /// Functional area, e.g. `consensus`.
    pub domain: String,
    /// Message stream within the domain, e.g. `blocks`.
    pub name: String,
    /// Version segment, e.g. `v1`.
    pub version: String,
}

impl Topic {
    pub fn new(domain: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            namespace: None,
            domain: domain.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Apply the namespace. Idempotent: a topic already carrying any
    /// namespace is returned unchanged.
    pub fn qualified(mut self, namespace: &str) -> Self {
        if self.namespace.is_none() && !namespace.is_empty() {
            self.namespace = Some(namespace.to_string());
        }
        self
    }

    /// Render to the dotted wire string.
    pub fn render(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}.{}.{}.{}", TOPIC_ORG, ns, self.domain, self.name, self.version),
            None => format!("{}.{}.{}.{}", TOPIC_ORG, self.domain, self.name, self.version),
        }
    }

    /// Parse a dotted wire string back into a topic.
    ///
    /// Accepts the 4-segment unqualified and 5-segment qualified forms.
    /// Anything else — wrong org, wrong arity, empty segments — is a
    /// protocol error.
    pub fn parse(s: &str) -> Result<Self, NetError> {
        let segments: Vec<&str> = s.split('.').collect();
        if segments.first() != Some(&TOPIC_ORG) {
            return Err(NetError::Protocol(format!("topic {:?} does not start with {:?}", s, TOPIC_ORG)));
        }
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(NetError::Protocol(format!("topic {:?} has empty segments", s)));
        }
        match segments.len() {
            4 => Ok(Self {
                namespace: None,
                domain: segments[1].to_string(),
                name: segments[2].to_string(),
                version: segments[3].to_string(),
            }),
            5 => Ok(Self {
                namespace: Some(segments[1].to_string()),
                domain: segments[2].to_string(),
                name: segments[3].to_string(),
                version: segments[4].to_string(),
            }),
            n => Err(NetError::Protocol(format!("topic {:?} has {} segments, want 4 or 5", s, n))),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Qualify a rendered topic string in place. The string form of
/// [`Topic::qualified`], for the call paths that never build the struct.
/// Same idempotence guarantee: a 5-segment topic passes through unchanged.
pub fn qualify_topic_str(topic: &str, namespace: Option<&str>) -> Result<String, NetError> {
    let parsed = Topic::parse(topic)?;
    match namespace {
        Some(ns) => Ok(parsed.qualified(ns).render()),
        None => Ok(parsed.render()),
    }
}

// ---------------------------------------------------------------------------
// Topic Manager
// ---------------------------------------------------------------------------

/// Diagnostics snapshot of one subscribed topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub topic: String,
    pub subscribed_at_ms: u64,
    pub handler_count: usize,
}

/// Reference-counted subscription bookkeeping.
///
/// Owned exclusively by the facade; mutation goes through
/// [`subscribe`](TopicManager::subscribe) and
/// [`unsubscribe`](TopicManager::unsubscribe) only.
#[derive(Default)]
pub struct TopicManager {
    topics: RwLock<HashMap<String, TopicInfo>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the topic's refcount, creating state on first reference.
    /// Returns the new count.
    pub fn subscribe(&self, topic: &str) -> usize {
        let mut topics = self.topics.write();
        let info = topics.entry(topic.to_string()).or_insert_with(|| TopicInfo {
            topic: topic.to_string(),
            subscribed_at_ms: unix_millis(),
            handler_count: 0,
        });
        info.handler_count += 1;
        info.handler_count
    }

    /// Decrement the topic's refcount, removing state at zero. Returns the
    /// remaining count. Unsubscribing an absent topic is a no-op returning
    /// zero — never an error, never negative.
    pub fn unsubscribe(&self, topic: &str) -> usize {
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(info) => {
                info.handler_count = info.handler_count.saturating_sub(1);
                let remaining = info.handler_count;
                if remaining == 0 {
                    topics.remove(topic);
                }
                remaining
            }
            None => 0,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }

    /// Snapshot of all subscribed topics.
    pub fn list(&self) -> Vec<TopicInfo> {
        let mut infos: Vec<TopicInfo> = self.topics.read().values().cloned().collect();
        infos.sort_by(|a, b| a.topic.cmp(&b.topic));
        infos
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_and_parse_unqualified() {
        let t = Topic::new("consensus", "blocks", "v1");
        assert_eq!(t.render(), "arc.consensus.blocks.v1");
        assert_eq!(Topic::parse("arc.consensus.blocks.v1").unwrap(), t);
    }

    #[test]
    fn render_and_parse_qualified() {
        let t = Topic::new("consensus", "blocks", "v1").qualified("testnet-7");
        assert_eq!(t.render(), "arc.testnet-7.consensus.blocks.v1");
        assert_eq!(Topic::parse("arc.testnet-7.consensus.blocks.v1").unwrap(), t);
    }

    #[test]
    fn qualification_is_idempotent() {
        let once = Topic::new("consensus", "blocks", "v1").qualified("testnet-7");
        let twice = once.clone().qualified("testnet-7");
        assert_eq!(once, twice);

        // Even with a different namespace the second application is a no-op.
        let other = once.clone().qualified("mainnet");
        assert_eq!(once, other);
    }

    #[test]
    fn qualify_str_is_idempotent() {
        let qualified = qualify_topic_str("arc.consensus.blocks.v1", Some("testnet-7")).unwrap();
        assert_eq!(qualified, "arc.testnet-7.consensus.blocks.v1");
        let again = qualify_topic_str(&qualified, Some("testnet-7")).unwrap();
        assert_eq!(again, qualified);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Topic::parse("btc.consensus.blocks.v1").is_err());
        assert!(Topic::parse("arc.blocks.v1").is_err());
        assert!(Topic::parse("arc.a.b.c.d.e").is_err());
        assert!(Topic::parse("arc..blocks.v1").is_err());
    }

    #[test]
    fn refcount_reaches_zero_exactly_once() {
        let mgr = TopicManager::new();
        let topic = "arc.consensus.blocks.v1";

        for i in 1..=3 {
            assert_eq!(mgr.subscribe(topic), i);
        }
        assert!(mgr.contains(topic));

        assert_eq!(mgr.unsubscribe(topic), 2);
        assert_eq!(mgr.unsubscribe(topic), 1);
        assert_eq!(mgr.unsubscribe(topic), 0);
        assert!(!mgr.contains(topic));
    }

    #[test]
    fn over_unsubscribe_never_goes_negative() {
        let mgr = TopicManager::new();
        let topic = "arc.consensus.blocks.v1";

        mgr.subscribe(topic);
        assert_eq!(mgr.unsubscribe(topic), 0);
        assert_eq!(mgr.unsubscribe(topic), 0);
        assert_eq!(mgr.unsubscribe(topic), 0);
        assert!(mgr.is_empty());

        // A fresh subscription after draining starts clean at one.
        assert_eq!(mgr.subscribe(topic), 1);
    }
}
