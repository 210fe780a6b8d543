//! # In-Process Substrate
//!
//! A complete [`HostTransport`] + [`MeshNetwork`] implementation backed by
//! in-process channels and `tokio::io::duplex` streams. Several nodes share
//! one [`MemoryHub`] and talk to each other without a socket in sight.
//!
//! This is what the integration tests run whole multi-node scenarios on, and
//! what the node binary wires up in single-node mode. It is intentionally
//! honest about failure modes the core cares about: dialing an unknown or
//! address-less peer fails, opening a stream on a protocol the remote never
//! registered fails (which is exactly what the negotiator's fallback probes
//! for), and mesh broadcast self-delivers like gossipsub does.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Connectedness, HostTransport, InboundStreamHandler, MeshMessage, MeshNetwork,
    MeshSubscription, PeerId,
};
use crate::error::NetError;
use async_trait::async_trait;

/// Buffer size of each duplex stream half.
const STREAM_BUFFER: usize = 64 * 1024;

/// Mesh delivery channel depth per subscriber. Broadcast is best-effort:
/// a subscriber that falls this far behind starts losing messages.
const MESH_CHANNEL_CAPACITY: usize = 256;

/// Marker signature attached to every mesh message, standing in for the
/// transport-level message signing a production mesh performs.
const MESH_SIGNATURE: [u8; 64] = [0u8; 64];

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Shared state connecting every in-process node.
pub struct MemoryHub {
    /// Peer ID → dialable address. An empty address means the peer is known
    /// but not dialable, mirroring a peerstore entry without addresses.
    peers: DashMap<PeerId, String>,
    /// Established connections, symmetric.
    connected: DashMap<PeerId, HashSet<PeerId>>,
    /// `(peer, protocol)` → inbound stream handler.
    handlers: DashMap<(PeerId, String), InboundStreamHandler>,
    /// Topic → subscriber delivery channels.
    topics: DashMap<String, Vec<(PeerId, mpsc::Sender<MeshMessage>)>>,
    /// Every dial that reached the hub, in order. For tests and diagnostics.
    dial_log: Mutex<Vec<(PeerId, PeerId)>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            connected: DashMap::new(),
            handlers: DashMap::new(),
            topics: DashMap::new(),
            dial_log: Mutex::new(Vec::new()),
        })
    }

    /// Register a node on the hub and get its transport + mesh handles.
    pub fn add_node(self: &Arc<Self>, id: impl Into<PeerId>) -> (Arc<MemoryTransport>, Arc<MemoryMesh>) {
        let id = id.into();
        self.peers
            .insert(id.clone(), format!("/memory/{}", id));
        let transport = Arc::new(MemoryTransport {
            hub: Arc::clone(self),
            local: id.clone(),
        });
        let mesh = Arc::new(MemoryMesh {
            hub: Arc::clone(self),
            local: id,
        });
        (transport, mesh)
    }

    /// Register a peer that exists in the peerstore and accepts dials but
    /// runs no protocols. Useful as dial fodder in maintenance tests.
    pub fn add_passive_peer(&self, id: impl Into<PeerId>) {
        let id = id.into();
        self.peers.insert(id.clone(), format!("/memory/{}", id));
    }

    /// Register a peer with no known address. The maintainer must skip it.
    pub fn add_addressless_peer(&self, id: impl Into<PeerId>) {
        self.peers.insert(id.into(), String::new());
    }

    /// Snapshot of every `(from, to)` dial in arrival order.
    pub fn dials(&self) -> Vec<(PeerId, PeerId)> {
        self.dial_log.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Host Transport
// ---------------------------------------------------------------------------

/// One node's view of the hub's dial/stream surface.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: PeerId,
}

#[async_trait]
impl HostTransport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn dial(&self, peer: &PeerId) -> Result<(), NetError> {
        let addr = self
            .hub
            .peers
            .get(peer)
            .map(|a| a.clone())
            .ok_or_else(|| NetError::Io(format!("unknown peer {}", peer)))?;
        if addr.is_empty() {
            return Err(NetError::Io(format!("no addresses for peer {}", peer)));
        }

        self.hub
            .dial_log
            .lock()
            .push((self.local.clone(), peer.clone()));

        self.hub
            .connected
            .entry(self.local.clone())
            .or_default()
            .insert(peer.clone());
        self.hub
            .connected
            .entry(peer.clone())
            .or_default()
            .insert(self.local.clone());

        trace!(from = %self.local, to = %peer, "memory dial established");
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<super::BoxStream, NetError> {
        let handler = self
            .hub
            .handlers
            .get(&(peer.clone(), protocol.to_string()))
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| {
                NetError::Io(format!("peer {} does not support protocol {}", peer, protocol))
            })?;

        let (local_end, remote_end) = tokio::io::duplex(STREAM_BUFFER);
        let source = self.local.clone();
        tokio::spawn(async move {
            handler(source, Box::new(remote_end)).await;
        });

        Ok(Box::new(local_end))
    }

    fn set_stream_handler(&self, protocol: &str, handler: InboundStreamHandler) {
        self.hub
            .handlers
            .insert((self.local.clone(), protocol.to_string()), handler);
        debug!(peer = %self.local, protocol, "stream handler installed");
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.hub
            .handlers
            .remove(&(self.local.clone(), protocol.to_string()));
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        let connected = self
            .hub
            .connected
            .get(&self.local)
            .map(|set| set.contains(peer))
            .unwrap_or(false);
        if connected {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    fn known_peers(&self) -> Vec<PeerId> {
        self.hub
            .peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| *p != self.local)
            .collect()
    }

    fn addresses(&self, peer: &PeerId) -> Vec<String> {
        match self.hub.peers.get(peer) {
            Some(addr) if !addr.is_empty() => vec![addr.clone()],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

/// One node's view of the hub's broadcast mesh.
pub struct MemoryMesh {
    hub: Arc<MemoryHub>,
    local: PeerId,
}

#[async_trait]
impl MeshNetwork for MemoryMesh {
    async fn join(&self, topic: &str) -> Result<(), NetError> {
        self.hub.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn leave(&self, topic: &str) -> Result<(), NetError> {
        if let Some(mut subs) = self.hub.topics.get_mut(topic) {
            subs.retain(|(peer, _)| *peer != self.local);
        }
        Ok(())
    }

    async fn broadcast(&self, topic: &str, data: Bytes) -> Result<(), NetError> {
        // Snapshot the subscriber list so no map lock is held across sends.
        let targets: Vec<(PeerId, mpsc::Sender<MeshMessage>)> = self
            .hub
            .topics
            .get(topic)
            .map(|subs| subs.clone())
            .unwrap_or_default();

        let msg = MeshMessage {
            source: self.local.clone(),
            topic: topic.to_string(),
            data,
            signature: Some(Bytes::from_static(&MESH_SIGNATURE)),
        };

        // Self-delivery included: the publisher's own subscription receives
        // the message like any other mesh member's.
        for (peer, tx) in targets {
            if tx.try_send(msg.clone()).is_err() {
                debug!(topic, subscriber = %peer, "mesh subscriber lagging, message dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MeshSubscription, NetError> {
        let (tx, rx) = mpsc::channel(MESH_CHANNEL_CAPACITY);
        self.hub
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((self.local.clone(), tx));
        Ok(MeshSubscription::new(rx))
    }

    fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let mut seen = HashSet::new();
        self.hub
            .topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .map(|(peer, _)| peer.clone())
                    .filter(|p| *p != self.local && seen.insert(p.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_connects_both_sides() {
        let hub = MemoryHub::new();
        let (a, _) = hub.add_node("node-a");
        let (b, _) = hub.add_node("node-b");

        assert_eq!(a.connectedness(&"node-b".into()), Connectedness::NotConnected);
        a.dial(&"node-b".into()).await.unwrap();
        assert_eq!(a.connectedness(&"node-b".into()), Connectedness::Connected);
        assert_eq!(b.connectedness(&"node-a".into()), Connectedness::Connected);
        assert_eq!(hub.dials().len(), 1);
    }

    #[tokio::test]
    async fn dial_addressless_peer_fails() {
        let hub = MemoryHub::new();
        let (a, _) = hub.add_node("node-a");
        hub.add_addressless_peer("ghost");

        assert!(a.dial(&"ghost".into()).await.is_err());
        assert!(a.addresses(&"ghost".into()).is_empty());
    }

    #[tokio::test]
    async fn stream_reaches_registered_handler() {
        let hub = MemoryHub::new();
        let (a, _) = hub.add_node("node-a");
        let (b, _) = hub.add_node("node-b");

        b.set_stream_handler(
            "/arc/echo/1.0.0",
            Arc::new(|_, mut stream| {
                async move {
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                }
                .boxed()
            }),
        );

        let mut stream = a.open_stream(&"node-b".into(), "/arc/echo/1.0.0").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn stream_on_unknown_protocol_fails() {
        let hub = MemoryHub::new();
        let (a, _) = hub.add_node("node-a");
        hub.add_node("node-b");

        let result = a.open_stream(&"node-b".into(), "/arc/missing/1.0.0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn broadcast_self_delivers_with_signature() {
        let hub = MemoryHub::new();
        let (_, mesh) = hub.add_node("node-a");

        mesh.join("arc.test.chatter.v1").await.unwrap();
        let mut sub = mesh.subscribe("arc.test.chatter.v1").await.unwrap();
        mesh.broadcast("arc.test.chatter.v1", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.data.as_ref(), b"hello");
        assert_eq!(msg.source, PeerId::new("node-a"));
        assert!(msg.signature.is_some());
    }

    #[tokio::test]
    async fn mesh_peers_excludes_self() {
        let hub = MemoryHub::new();
        let (_, mesh_a) = hub.add_node("node-a");
        let (_, mesh_b) = hub.add_node("node-b");

        mesh_a.join("arc.test.chatter.v1").await.unwrap();
        let _sub_a = mesh_a.subscribe("arc.test.chatter.v1").await.unwrap();
        assert!(mesh_a.mesh_peers("arc.test.chatter.v1").is_empty());

        let _sub_b = mesh_b.subscribe("arc.test.chatter.v1").await.unwrap();
        assert_eq!(mesh_a.mesh_peers("arc.test.chatter.v1"), vec![PeerId::new("node-b")]);
    }
}
