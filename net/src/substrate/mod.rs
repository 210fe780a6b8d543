//! # Transport Substrate Interfaces
//!
//! The networking core does not dial sockets, traverse NATs, or run a
//! peerstore. It consumes a transport substrate through the narrow traits in
//! this module: [`HostTransport`] for dialing and raw bidirectional streams,
//! [`MeshNetwork`] for topic-based broadcast with local mesh membership, and
//! [`ContentHasher`]/[`SignaturePolicy`] for the two injected crypto
//! capabilities. Everything above these traits is transport-agnostic and
//! testable without a real network — the [`memory`] implementation runs whole
//! multi-node scenarios in one process.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NetError;

// ---------------------------------------------------------------------------
// Peer Identity
// ---------------------------------------------------------------------------

/// Opaque peer identity assigned by the substrate.
///
/// The core never inspects the contents — it only compares, hashes, and
/// logs them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection state of a remote peer, as reported by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

// ---------------------------------------------------------------------------
// Raw Streams
// ---------------------------------------------------------------------------

/// A bidirectional byte stream opened by the substrate. Half-close of the
/// write side goes through `AsyncWriteExt::shutdown`; dropping the stream
/// resets it.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Boxed stream handed across the trait boundary.
pub type BoxStream = Box<dyn RawStream>;

/// Callback invoked once per inbound stream on a registered protocol.
/// The substrate spawns a task per stream; the handler owns the stream for
/// its lifetime.
pub type InboundStreamHandler =
    Arc<dyn Fn(PeerId, BoxStream) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Host Transport
// ---------------------------------------------------------------------------

/// The dial/stream surface of the P2P host.
///
/// Everything the core needs from the substrate, and nothing more: dial a
/// peer, open or accept a stream on a protocol ID, and read connection and
/// peerstore state.
#[async_trait]
pub trait HostTransport: Send + Sync + 'static {
    /// This node's own identity.
    fn local_peer(&self) -> PeerId;

    /// Establish a connection to the peer. Idempotent when already connected.
    async fn dial(&self, peer: &PeerId) -> Result<(), NetError>;

    /// Open a bidirectional stream to the peer on the given protocol ID.
    /// Fails when the peer does not support the protocol — the negotiator
    /// relies on that failure for its qualified/original fallback.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, NetError>;

    /// Register a handler invoked for each inbound stream on `protocol`.
    /// Re-registering the same protocol replaces the handler.
    fn set_stream_handler(&self, protocol: &str, handler: InboundStreamHandler);

    /// Remove a previously registered stream handler. No-op when absent.
    fn remove_stream_handler(&self, protocol: &str);

    /// Current connection state for the peer.
    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// All peers the substrate's peerstore knows about, connected or not.
    fn known_peers(&self) -> Vec<PeerId>;

    /// Known addresses for the peer. Empty means the peer is not dialable.
    fn addresses(&self, peer: &PeerId) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Mesh Broadcast
// ---------------------------------------------------------------------------

/// A message delivered by the mesh primitive for a subscribed topic.
#[derive(Debug, Clone)]
pub struct MeshMessage {
    /// The peer the message propagated from.
    pub source: PeerId,
    /// The topic string the message was published on.
    pub topic: String,
    /// Opaque message bytes (a serialized envelope, as far as we publish).
    pub data: Bytes,
    /// Transport-level signature, when the mesh signs messages. The core
    /// only ever checks presence, never validity — that is the substrate's
    /// job.
    pub signature: Option<Bytes>,
}

/// Live subscription to a topic's message flow. Dropping it cancels the
/// subscription at the mesh level.
pub struct MeshSubscription {
    rx: tokio::sync::mpsc::Receiver<MeshMessage>,
}

impl MeshSubscription {
    pub fn new(rx: tokio::sync::mpsc::Receiver<MeshMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the mesh side has torn the topic down.
    pub async fn next(&mut self) -> Option<MeshMessage> {
        self.rx.recv().await
    }
}

/// The topic-mesh broadcast surface.
///
/// Implementations are expected to deliver a node's own publishes back to
/// its local subscription (self-delivery); the pubsub layer's dedup cache
/// absorbs the echo.
#[async_trait]
pub trait MeshNetwork: Send + Sync + 'static {
    /// Join the topic's mesh. Idempotent.
    async fn join(&self, topic: &str) -> Result<(), NetError>;

    /// Leave the topic's mesh. Idempotent.
    async fn leave(&self, topic: &str) -> Result<(), NetError>;

    /// Broadcast bytes to the topic's mesh.
    async fn broadcast(&self, topic: &str, data: Bytes) -> Result<(), NetError>;

    /// Subscribe to the topic's message flow. Requires a prior `join`.
    async fn subscribe(&self, topic: &str) -> Result<MeshSubscription, NetError>;

    /// Remote peers currently in this topic's mesh (excluding self).
    fn mesh_peers(&self, topic: &str) -> Vec<PeerId>;
}

// ---------------------------------------------------------------------------
// Injected Crypto Capabilities
// ---------------------------------------------------------------------------

/// Content hashing capability, used for pubsub dedup keys.
pub trait ContentHasher: Send + Sync + 'static {
    fn digest(&self, bytes: &[u8]) -> [u8; 32];
}

/// Default hasher. BLAKE3 is faster than SHA-256 on every platform that
/// matters, and it's a proper cryptographic hash — not a toy.
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn digest(&self, bytes: &[u8]) -> [u8; 32] {
        *blake3::hash(bytes).as_bytes()
    }
}

/// Signature-presence capability for inbound mesh messages. Validity is
/// checked by the substrate before delivery; this layer only enforces that
/// topics configured to require signatures actually got one.
pub trait SignaturePolicy: Send + Sync + 'static {
    fn has_signature(&self, msg: &MeshMessage) -> bool;
}

/// Default policy: a signature is whatever the substrate attached.
pub struct PresencePolicy;

impl SignaturePolicy for PresencePolicy {
    fn has_signature(&self, msg: &MeshMessage) -> bool {
        msg.signature.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display_roundtrip() {
        let p = PeerId::new("12D3KooWExample");
        assert_eq!(p.to_string(), "12D3KooWExample");
        assert_eq!(PeerId::from("12D3KooWExample"), p);
    }

    #[test]
    fn blake3_digest_is_stable() {
        let h = Blake3Hasher;
        assert_eq!(h.digest(b"arclight"), h.digest(b"arclight"));
        assert_ne!(h.digest(b"arclight"), h.digest(b"arclite"));
    }

    #[test]
    fn presence_policy_checks_presence_only() {
        let policy = PresencePolicy;
        let mut msg = MeshMessage {
            source: PeerId::new("p"),
            topic: "arc.consensus.blocks.v1".into(),
            data: Bytes::from_static(b"x"),
            signature: None,
        };
        assert!(!policy.has_signature(&msg));
        msg.signature = Some(Bytes::from_static(&[0u8; 64]));
        assert!(policy.has_signature(&msg));
    }
}
