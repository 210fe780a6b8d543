//! # Network Facade
//!
//! The single entry point the rest of the node talks to. Owns every
//! component of the communication layer — registry, negotiator, gate,
//! limiters, topic manager, validator, pubsub and stream transports, and
//! the connection maintainer — and wires them over the injected substrate.
//!
//! Registration bridges the namespace migration window: every protocol is
//! registered under its qualified ID and, when different, its original ID,
//! so peers that have not adopted namespacing still reach the handler.
//! Unregistration removes both.
//!
//! Lifecycle: `new` wires everything cold, `start` spawns the background
//! tasks (limiter and dedup sweepers, maintenance loop) and kicks one
//! startup maintenance round, `stop` tears all of it down and refuses
//! further work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::NetError;
use crate::gate::InflightGate;
use crate::gossip::publisher::{Publisher, TopicStats};
use crate::gossip::validator::{MessageValidator, TopicRules, ValidatorStats};
use crate::gossip::{PubSub, PublishOptions, Subscription, TopicHandler};
use crate::maintain::{Maintainer, MaintainerStats, TriggerReason};
use crate::negotiate::{Negotiator, NegotiatorStats, PreferenceInfo};
use crate::ratelimit::{ConnectionLimiter, LimiterStats, MessageLimiter};
use crate::registry::{qualify_protocol, ProtocolHandler, ProtocolInfo, ProtocolRegistry};
use crate::stream::{CallOptions, StreamTransport};
use crate::substrate::{
    Blake3Hasher, ContentHasher, HostTransport, MeshNetwork, PeerId, PresencePolicy,
    SignaturePolicy,
};
use crate::topic::{Topic, TopicInfo, TopicManager};

/// Full diagnostics snapshot, serializable for a status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub local_peer: String,
    pub protocols: Vec<ProtocolInfo>,
    pub topics: Vec<TopicInfo>,
    pub negotiator: NegotiatorStats,
    pub preferences: Vec<PreferenceInfo>,
    pub connection_limiter: LimiterStats,
    pub message_limiter: LimiterStats,
    pub validator: ValidatorStats,
    pub maintainer: MaintainerStats,
    pub publish_stats: Vec<(String, TopicStats)>,
}

/// The composed networking layer.
pub struct Network {
    cfg: NetworkConfig,
    host: Arc<dyn HostTransport>,
    registry: Arc<ProtocolRegistry>,
    negotiator: Arc<Negotiator>,
    gate: Arc<InflightGate>,
    conn_limiter: Arc<ConnectionLimiter>,
    msg_limiter: Arc<MessageLimiter>,
    topics: Arc<TopicManager>,
    validator: Arc<MessageValidator>,
    publisher: Arc<Publisher>,
    pubsub: Arc<PubSub>,
    stream: Arc<StreamTransport>,
    maintainer: Arc<Maintainer>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Network {
    /// Wire the facade with the default crypto capabilities (BLAKE3 hashing,
    /// signature-presence policy).
    pub fn new(
        cfg: NetworkConfig,
        host: Arc<dyn HostTransport>,
        mesh: Arc<dyn MeshNetwork>,
    ) -> Arc<Self> {
        Self::with_capabilities(cfg, host, mesh, Arc::new(Blake3Hasher), Arc::new(PresencePolicy))
    }

    /// Wire the facade with injected hashing and signature capabilities.
    pub fn with_capabilities(
        cfg: NetworkConfig,
        host: Arc<dyn HostTransport>,
        mesh: Arc<dyn MeshNetwork>,
        hasher: Arc<dyn ContentHasher>,
        signatures: Arc<dyn SignaturePolicy>,
    ) -> Arc<Self> {
        let registry = Arc::new(ProtocolRegistry::new());
        let negotiator = Arc::new(Negotiator::new(cfg.preference_ttl));
        let gate = Arc::new(InflightGate::new(cfg.inflight_per_protocol));
        let conn_limiter = ConnectionLimiter::new(cfg.max_connections, cfg.max_connections_per_source);
        let msg_limiter = MessageLimiter::new(cfg.message_rate_cap, cfg.message_rate_window);
        let topics = Arc::new(TopicManager::new());
        let validator = MessageValidator::with_default_ttl(hasher, signatures, cfg.dedup_ttl);
        let publisher = Arc::new(Publisher::new());

        let pubsub = PubSub::new(
            Arc::clone(&mesh),
            Arc::clone(&topics),
            Arc::clone(&validator),
            Arc::clone(&publisher),
            Arc::clone(&msg_limiter),
            cfg.namespace.clone(),
            cfg.max_message_size,
            cfg.message_timeout,
            host.local_peer(),
        );
        let stream = StreamTransport::new(
            Arc::clone(&host),
            Arc::clone(&negotiator),
            Arc::clone(&gate),
            Arc::clone(&registry),
            Arc::clone(&conn_limiter),
            &cfg,
        );
        let maintainer = Maintainer::new(
            Arc::clone(&host),
            mesh,
            Arc::clone(&topics),
            cfg.force_connect.clone(),
        );

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            host,
            registry,
            negotiator,
            gate,
            conn_limiter,
            msg_limiter,
            topics,
            validator,
            publisher,
            pubsub,
            stream,
            maintainer,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.host.local_peer()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    /// Spawn the background tasks and kick the first maintenance round.
    /// Idempotent — a second call is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conn_limiter.start();
        self.msg_limiter.start();
        self.validator.start();

        let maintenance = self.maintainer.start(self.shutdown.subscribe());
        self.tasks.lock().push(maintenance);
        if self.cfg.force_connect.enabled {
            self.maintainer.trigger(TriggerReason::Startup);
        }

        info!(peer = %self.host.local_peer(), "network facade started");
    }

    /// Tear everything down: subscriptions, sweepers, maintenance loop.
    /// After `stop` the facade rejects all further operations.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        self.pubsub.shutdown().await;
        self.conn_limiter.stop().await;
        self.msg_limiter.stop().await;
        self.validator.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!(peer = %self.host.local_peer(), "network facade stopped");
    }

    fn ensure_running(&self) -> Result<(), NetError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NetError::Shutdown);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Protocols
    // -----------------------------------------------------------------------

    /// Register a handler under the protocol's qualified ID and, when a
    /// namespace makes them differ, its original ID too. Duplicate
    /// registration of either form fails without touching the other's
    /// existing state.
    pub fn register_protocol(&self, id: &str, handler: ProtocolHandler) -> Result<(), NetError> {
        self.ensure_running()?;
        let qualified = qualify_protocol(id, self.cfg.namespace.as_deref());

        self.registry.register(&qualified, Arc::clone(&handler))?;
        self.host
            .set_stream_handler(&qualified, self.stream.make_inbound_handler(&qualified));

        if qualified != id {
            if let Err(e) = self.registry.register(id, handler) {
                // Keep registration atomic from the caller's view.
                self.registry.unregister(&qualified);
                self.host.remove_stream_handler(&qualified);
                return Err(e);
            }
            self.host
                .set_stream_handler(id, self.stream.make_inbound_handler(id));
        }

        debug!(protocol = id, qualified = %qualified, "protocol registered");
        Ok(())
    }

    /// Remove both forms of the protocol's registration. Idempotent.
    pub fn unregister_protocol(&self, id: &str) {
        let qualified = qualify_protocol(id, self.cfg.namespace.as_deref());
        for pid in [qualified.as_str(), id] {
            self.registry.unregister(pid);
            self.host.remove_stream_handler(pid);
            self.gate.remove(pid);
        }
        debug!(protocol = id, "protocol unregistered");
    }

    /// Introspection: one protocol's registration snapshot.
    pub fn protocol_info(&self, id: &str) -> Option<ProtocolInfo> {
        let qualified = qualify_protocol(id, self.cfg.namespace.as_deref());
        self.registry.info(&qualified).or_else(|| self.registry.info(id))
    }

    /// Introspection: every registered protocol.
    pub fn protocols(&self) -> Vec<ProtocolInfo> {
        self.registry.list()
    }

    /// Call a remote peer's handler for `protocol` and return its response
    /// payload. The protocol ID is taken in original (unqualified) form;
    /// qualification and per-peer negotiation happen internally.
    pub async fn call(
        &self,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<Bytes, NetError> {
        self.ensure_running()?;
        let qualified = qualify_protocol(protocol, self.cfg.namespace.as_deref());
        self.stream.call(peer, protocol, &qualified, payload, opts).await
    }

    // -----------------------------------------------------------------------
    // PubSub
    // -----------------------------------------------------------------------

    /// Subscribe a handler to a topic with validation rules. Fails on a
    /// duplicate subscription to the same qualified topic.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        rules: TopicRules,
        handler: TopicHandler,
    ) -> Result<Subscription, NetError> {
        self.ensure_running()?;
        self.pubsub.subscribe(&topic.render(), rules, handler).await
    }

    /// Publish a payload to a topic. Errors only on pre-flight rejection
    /// (size cap, encode failure) or when the mesh refuses the send.
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: Bytes,
        opts: PublishOptions,
    ) -> Result<(), NetError> {
        self.ensure_running()?;
        self.pubsub.publish(&topic.render(), payload, opts).await
    }

    /// Introspection: every subscribed topic.
    pub fn topics(&self) -> Vec<TopicInfo> {
        self.topics.list()
    }

    // -----------------------------------------------------------------------
    // Maintenance & Diagnostics
    // -----------------------------------------------------------------------

    /// Request a maintenance round. Coalesced and cooldown-guarded; never
    /// blocks.
    pub fn trigger_maintenance(&self, reason: TriggerReason) {
        self.maintainer.trigger(reason);
    }

    /// Replace the maintainer's business/bootstrap peer lists at runtime.
    pub fn update_maintenance_peers(&self, business: Vec<PeerId>, bootstrap: Vec<PeerId>) {
        self.maintainer.update_peers(business, bootstrap);
    }

    /// Full diagnostics snapshot.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            local_peer: self.host.local_peer().to_string(),
            protocols: self.registry.list(),
            topics: self.topics.list(),
            negotiator: self.negotiator.stats(),
            preferences: self.negotiator.snapshot(),
            connection_limiter: self.conn_limiter.stats(),
            message_limiter: self.msg_limiter.stats(),
            validator: self.validator.stats(),
            maintainer: self.maintainer.stats(),
            publish_stats: self.publisher.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::memory::MemoryHub;
    use futures::FutureExt;

    fn ping_handler() -> ProtocolHandler {
        Arc::new(|_, _| async { Ok(Bytes::from_static(b"pong")) }.boxed())
    }

    fn facade(hub: &Arc<MemoryHub>, id: &str, namespace: Option<&str>) -> Arc<Network> {
        let (host, mesh) = hub.add_node(id);
        let cfg = NetworkConfig {
            namespace: namespace.map(String::from),
            ..NetworkConfig::default()
        };
        Network::new(cfg, host, mesh)
    }

    #[tokio::test]
    async fn registers_both_protocol_forms() {
        let hub = MemoryHub::new();
        let net = facade(&hub, "node-a", Some("testnet-7"));

        net.register_protocol("/arc/ping/1.0.0", ping_handler()).unwrap();

        let ids: Vec<String> = net.protocols().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["/arc/ping/1.0.0", "/testnet-7/arc/ping/1.0.0"]);

        net.unregister_protocol("/arc/ping/1.0.0");
        assert!(net.protocols().is_empty());

        // Both forms are free again.
        net.register_protocol("/arc/ping/1.0.0", ping_handler()).unwrap();
    }

    #[tokio::test]
    async fn duplicate_protocol_registration_fails() {
        let hub = MemoryHub::new();
        let net = facade(&hub, "node-a", None);

        net.register_protocol("/arc/ping/1.0.0", ping_handler()).unwrap();
        let second = net.register_protocol("/arc/ping/1.0.0", ping_handler());
        assert!(matches!(second, Err(NetError::DuplicateRegistration(_))));
    }

    #[tokio::test]
    async fn facade_call_roundtrip() {
        let hub = MemoryHub::new();
        let client = facade(&hub, "client", None);
        let server = facade(&hub, "server", None);

        server.register_protocol("/arc/ping/1.0.0", ping_handler()).unwrap();

        let response = client
            .call(
                &PeerId::new("server"),
                "/arc/ping/1.0.0",
                Bytes::from_static(b"ping"),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.as_ref(), b"pong");
    }

    #[tokio::test]
    async fn stopped_facade_rejects_work() {
        let hub = MemoryHub::new();
        let net = facade(&hub, "node-a", None);
        net.start().await;
        net.stop().await;

        let result = net
            .call(
                &PeerId::new("elsewhere"),
                "/arc/ping/1.0.0",
                Bytes::new(),
                CallOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(NetError::Shutdown)));
        assert!(net.register_protocol("/arc/ping/1.0.0", ping_handler()).is_err());
    }

    #[tokio::test]
    async fn diagnostics_reflect_state() {
        let hub = MemoryHub::new();
        let net = facade(&hub, "node-a", None);
        net.register_protocol("/arc/ping/1.0.0", ping_handler()).unwrap();

        let handler: TopicHandler = Arc::new(|_, _| async { Ok(()) }.boxed());
        net.subscribe(&Topic::new("test", "chatter", "v1"), TopicRules::default(), handler)
            .await
            .unwrap();

        let diag = net.diagnostics();
        assert_eq!(diag.local_peer, "node-a");
        assert_eq!(diag.protocols.len(), 1);
        assert_eq!(diag.topics.len(), 1);
        assert_eq!(diag.topics[0].topic, "arc.test.chatter.v1");
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let hub = MemoryHub::new();
        let net = facade(&hub, "node-a", None);
        net.start().await;
        net.start().await;
        net.stop().await;
        net.stop().await;
    }
}
