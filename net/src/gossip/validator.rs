//! # Inbound Message Validation
//!
//! Per-topic rules applied to gossip traffic before it reaches a handler:
//! size cap, signature requirement, a per-peer-per-topic rate window, and
//! content-hash de-duplication.
//!
//! Dedup keys are the content hash of the application payload, not the
//! whole encoded envelope — the envelope carries a fresh correlation ID and
//! timestamp per send, so hashing it would make every copy of the same
//! message look unique. The hash capability is injected; the default is
//! BLAKE3.
//!
//! A background sweep purges expired dedup entries and stale rate windows
//! on a fixed interval, so memory stays bounded regardless of traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{DEDUP_SWEEP_INTERVAL, DEFAULT_DEDUP_TTL, DEFAULT_MAX_MESSAGE_SIZE};
use crate::substrate::{ContentHasher, MeshMessage, PeerId, SignaturePolicy};

/// Validation rules for one topic.
#[derive(Debug, Clone)]
pub struct TopicRules {
    /// Cap on the encoded message as received from the mesh.
    pub max_message_size: usize,
    /// Reject messages the substrate delivered without a signature.
    pub require_signature: bool,
    /// Messages per second allowed from one peer on this topic. Zero
    /// disables the per-topic rate check.
    pub rate_per_sec: u32,
    /// How long a payload hash blocks repeats.
    pub dedup_ttl: Duration,
}

impl Default for TopicRules {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            require_signature: false,
            rate_per_sec: 0,
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }
}

/// Why a message was rejected. Inbound rejections are dropped and counted;
/// they never propagate back to the message's publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooLarge { size: usize, max: usize },
    MissingSignature,
    RateExceeded,
    Duplicate,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::TooLarge { size, max } => write!(f, "message of {} bytes over cap {}", size, max),
            Rejection::MissingSignature => write!(f, "signature required but absent"),
            Rejection::RateExceeded => write!(f, "per-topic message rate exceeded"),
            Rejection::Duplicate => write!(f, "duplicate payload within dedup window"),
        }
    }
}

/// Validator counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatorStats {
    pub topics_with_rules: usize,
    pub dedup_entries: usize,
    pub rejected_size: u64,
    pub rejected_signature: u64,
    pub rejected_rate: u64,
    pub rejected_duplicate: u64,
}

/// Per-topic validation engine.
pub struct MessageValidator {
    rules: DashMap<String, TopicRules>,
    /// Payload hash → dedup entry expiry.
    seen: DashMap<[u8; 32], Instant>,
    /// `(topic, peer)` → one-second rate window.
    windows: DashMap<(String, PeerId), Vec<Instant>>,
    hasher: Arc<dyn ContentHasher>,
    signatures: Arc<dyn SignaturePolicy>,
    /// Dedup TTL applied to topics without installed rules.
    default_dedup_ttl: Duration,
    rejected_size: AtomicU64,
    rejected_signature: AtomicU64,
    rejected_rate: AtomicU64,
    rejected_duplicate: AtomicU64,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MessageValidator {
    pub fn new(hasher: Arc<dyn ContentHasher>, signatures: Arc<dyn SignaturePolicy>) -> Arc<Self> {
        Self::with_default_ttl(hasher, signatures, DEFAULT_DEDUP_TTL)
    }

    /// Build with a configured dedup TTL for topics that never installed
    /// rules of their own.
    pub fn with_default_ttl(
        hasher: Arc<dyn ContentHasher>,
        signatures: Arc<dyn SignaturePolicy>,
        default_dedup_ttl: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            rules: DashMap::new(),
            seen: DashMap::new(),
            windows: DashMap::new(),
            hasher,
            signatures,
            default_dedup_ttl,
            rejected_size: AtomicU64::new(0),
            rejected_signature: AtomicU64::new(0),
            rejected_rate: AtomicU64::new(0),
            rejected_duplicate: AtomicU64::new(0),
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    /// Install rules for a topic. Re-installing replaces them.
    pub fn set_rules(&self, topic: &str, rules: TopicRules) {
        self.rules.insert(topic.to_string(), rules);
    }

    /// Drop a topic's rules. Idempotent.
    pub fn remove_rules(&self, topic: &str) {
        self.rules.remove(topic);
    }

    fn rules_for(&self, topic: &str) -> TopicRules {
        self.rules.get(topic).map(|r| r.clone()).unwrap_or(TopicRules {
            dedup_ttl: self.default_dedup_ttl,
            ..TopicRules::default()
        })
    }

    /// Outbound pre-flight: dedup only. Size is enforced by the publish
    /// path against the caller's limit before encoding; signatures are
    /// attached by the mesh, not by us.
    pub fn check_outbound(&self, topic: &str, payload: &[u8]) -> Result<(), Rejection> {
        self.check_dedup(topic, payload)
    }

    /// Inbound checks that need only the raw mesh message: size, signature,
    /// rate. Runs before the envelope decode.
    pub fn check_inbound_raw(&self, topic: &str, msg: &MeshMessage) -> Result<(), Rejection> {
        let rules = self.rules_for(topic);

        if msg.data.len() > rules.max_message_size {
            self.rejected_size.fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::TooLarge {
                size: msg.data.len(),
                max: rules.max_message_size,
            });
        }

        if rules.require_signature && !self.signatures.has_signature(msg) {
            self.rejected_signature.fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::MissingSignature);
        }

        if rules.rate_per_sec > 0 {
            let now = Instant::now();
            let key = (topic.to_string(), msg.source.clone());
            let mut window = self.windows.entry(key).or_default();
            window.retain(|t| now.duration_since(*t) <= Duration::from_secs(1));
            if window.len() >= rules.rate_per_sec as usize {
                self.rejected_rate.fetch_add(1, Ordering::Relaxed);
                return Err(Rejection::RateExceeded);
            }
            window.push(now);
        }

        Ok(())
    }

    /// Inbound dedup over the decoded payload. Runs after the envelope
    /// decode so publisher and subscriber key on the same bytes.
    pub fn check_inbound_payload(&self, topic: &str, payload: &[u8]) -> Result<(), Rejection> {
        self.check_dedup(topic, payload)
    }

    fn check_dedup(&self, topic: &str, payload: &[u8]) -> Result<(), Rejection> {
        let ttl = self.rules_for(topic).dedup_ttl;
        let digest = self.hasher.digest(payload);
        let now = Instant::now();

        let mut fresh = false;
        let mut entry = self.seen.entry(digest).or_insert_with(|| {
            fresh = true;
            now + ttl
        });
        if fresh {
            return Ok(());
        }
        if *entry > now {
            self.rejected_duplicate.fetch_add(1, Ordering::Relaxed);
            trace!(topic, digest = %hex::encode(&digest[..8]), "duplicate payload suppressed");
            return Err(Rejection::Duplicate);
        }
        // Expired entry: refresh in place and admit.
        *entry = now + ttl;
        Ok(())
    }

    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            topics_with_rules: self.rules.len(),
            dedup_entries: self.seen.len(),
            rejected_size: self.rejected_size.load(Ordering::Relaxed),
            rejected_signature: self.rejected_signature.load(Ordering::Relaxed),
            rejected_rate: self.rejected_rate.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background sweep. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let validator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEDUP_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let before = validator.seen.len();
                        validator.seen.retain(|_, expires| *expires > now);
                        let swept = before - validator.seen.len();
                        if swept > 0 {
                            trace!(swept, "dedup cache swept");
                        }
                        validator.windows.retain(|_, window| {
                            window.retain(|t| now.duration_since(*t) <= Duration::from_secs(1));
                            !window.is_empty()
                        });
                    }
                    _ = shutdown.changed() => {
                        debug!("validator sweeper stopped");
                        return;
                    }
                }
            }
        }));
    }

    /// Stop the sweep task and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{Blake3Hasher, PresencePolicy};
    use bytes::Bytes;

    fn validator() -> Arc<MessageValidator> {
        MessageValidator::new(Arc::new(Blake3Hasher), Arc::new(PresencePolicy))
    }

    fn msg(data: &[u8], signed: bool) -> MeshMessage {
        MeshMessage {
            source: PeerId::new("peer-1"),
            topic: "arc.consensus.blocks.v1".into(),
            data: Bytes::copy_from_slice(data),
            signature: signed.then(|| Bytes::from_static(&[0u8; 64])),
        }
    }

    #[tokio::test]
    async fn oversize_is_rejected() {
        let v = validator();
        v.set_rules(
            "arc.consensus.blocks.v1",
            TopicRules {
                max_message_size: 16,
                ..TopicRules::default()
            },
        );

        let result = v.check_inbound_raw("arc.consensus.blocks.v1", &msg(&[0u8; 17], true));
        assert!(matches!(result, Err(Rejection::TooLarge { size: 17, max: 16 })));
        assert_eq!(v.stats().rejected_size, 1);
    }

    #[tokio::test]
    async fn unsigned_message_rejected_when_required() {
        let v = validator();
        v.set_rules(
            "arc.consensus.blocks.v1",
            TopicRules {
                require_signature: true,
                ..TopicRules::default()
            },
        );

        assert_eq!(
            v.check_inbound_raw("arc.consensus.blocks.v1", &msg(b"x", false)),
            Err(Rejection::MissingSignature)
        );
        assert!(v
            .check_inbound_raw("arc.consensus.blocks.v1", &msg(b"x", true))
            .is_ok());
    }

    #[tokio::test]
    async fn per_topic_rate_window() {
        let v = validator();
        v.set_rules(
            "arc.consensus.blocks.v1",
            TopicRules {
                rate_per_sec: 2,
                ..TopicRules::default()
            },
        );

        assert!(v.check_inbound_raw("arc.consensus.blocks.v1", &msg(b"a", true)).is_ok());
        assert!(v.check_inbound_raw("arc.consensus.blocks.v1", &msg(b"b", true)).is_ok());
        assert_eq!(
            v.check_inbound_raw("arc.consensus.blocks.v1", &msg(b"c", true)),
            Err(Rejection::RateExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_blocks_repeats_until_ttl() {
        let v = validator();
        v.set_rules(
            "arc.consensus.blocks.v1",
            TopicRules {
                dedup_ttl: Duration::from_secs(60),
                ..TopicRules::default()
            },
        );

        assert!(v.check_inbound_payload("arc.consensus.blocks.v1", b"block-7").is_ok());
        assert_eq!(
            v.check_inbound_payload("arc.consensus.blocks.v1", b"block-7"),
            Err(Rejection::Duplicate)
        );

        // Different payload is unaffected.
        assert!(v.check_inbound_payload("arc.consensus.blocks.v1", b"block-8").is_ok());

        // Past the TTL the same payload is fresh again.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(v.check_inbound_payload("arc.consensus.blocks.v1", b"block-7").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_purges_expired_hashes() {
        let v = validator();
        v.set_rules(
            "arc.consensus.blocks.v1",
            TopicRules {
                dedup_ttl: Duration::from_secs(5),
                ..TopicRules::default()
            },
        );
        v.start();

        v.check_outbound("arc.consensus.blocks.v1", b"payload").unwrap();
        assert_eq!(v.stats().dedup_entries, 1);

        tokio::time::advance(DEDUP_SWEEP_INTERVAL + Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(v.stats().dedup_entries, 0);

        v.stop().await;
    }

    #[tokio::test]
    async fn unknown_topic_uses_default_rules() {
        let v = validator();
        // No rules installed: default size cap applies, no signature needed.
        assert!(v.check_inbound_raw("arc.misc.chatter.v1", &msg(b"hello", false)).is_ok());
    }
}
