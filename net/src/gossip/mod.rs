//! # PubSub Transport
//!
//! Wraps the mesh broadcast primitive with everything the rest of the node
//! needs to never think about: topic join/leave, namespace qualification
//! (applied exactly once per call path), the publish pipeline, and one
//! long-lived subscription loop per topic running the
//! decode → validate → dispatch sequence.
//!
//! ## Publish pipeline
//!
//! size cap (pre-flight error) → envelope encode with compression hint →
//! dedup pre-flight (policy drop, invisible to the caller) → mesh broadcast
//! under a deadline → local loopback when the mesh has ≤ 1 peer.
//!
//! The loopback is a documented single-node/test special case, not a
//! delivery guarantee: with a real multi-peer mesh the publisher's own copy
//! arrives back through the mesh and is absorbed by the dedup cache.
//!
//! ## Inbound pipeline
//!
//! per-peer rate check → size/signature/rate rules → envelope decode →
//! payload dedup → topic-match assertion → handler dispatch. Every failure
//! is dropped and logged; nothing on this path propagates to the message's
//! publisher or kills the subscription loop. Handler panics are caught at
//! the invocation boundary.

pub mod publisher;
pub mod validator;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::NetError;
use crate::substrate::{MeshMessage, MeshNetwork, MeshSubscription, PeerId};
use crate::topic::{qualify_topic_str, TopicManager};
use crate::wire::Envelope;
use publisher::Publisher;
use validator::{MessageValidator, TopicRules};

use crate::ratelimit::MessageLimiter;

/// Handler invoked once per accepted message on a subscribed topic.
pub type TopicHandler =
    Arc<dyn Fn(PeerId, Bytes) -> BoxFuture<'static, Result<(), NetError>> + Send + Sync>;

/// Per-publish overrides. Everything unset falls back to the transport's
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub max_size: Option<usize>,
    pub timeout: Option<Duration>,
}

/// The pubsub transport. One instance per facade.
pub struct PubSub {
    mesh: Arc<dyn MeshNetwork>,
    topics: Arc<TopicManager>,
    validator: Arc<MessageValidator>,
    publisher: Arc<Publisher>,
    msg_limiter: Arc<MessageLimiter>,
    handlers: DashMap<String, TopicHandler>,
    /// Per-topic subscription loop: shutdown signal + task handle.
    loops: DashMap<String, (watch::Sender<bool>, JoinHandle<()>)>,
    namespace: Option<String>,
    max_message_size: usize,
    message_timeout: Duration,
    local_peer: PeerId,
}

impl PubSub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mesh: Arc<dyn MeshNetwork>,
        topics: Arc<TopicManager>,
        validator: Arc<MessageValidator>,
        publisher: Arc<Publisher>,
        msg_limiter: Arc<MessageLimiter>,
        namespace: Option<String>,
        max_message_size: usize,
        message_timeout: Duration,
        local_peer: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            mesh,
            topics,
            validator,
            publisher,
            msg_limiter,
            handlers: DashMap::new(),
            loops: DashMap::new(),
            namespace,
            max_message_size,
            message_timeout,
            local_peer,
        })
    }

    /// Subscribe a handler to a topic. The topic string may be qualified or
    /// not — qualification is idempotent, so both arrive at the same mesh
    /// topic. A second subscription to the same qualified topic fails fast,
    /// same invariant as protocol registration.
    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        rules: TopicRules,
        handler: TopicHandler,
    ) -> Result<Subscription, NetError> {
        let qualified = qualify_topic_str(topic, self.namespace.as_deref())?;

        if self.handlers.contains_key(&qualified) {
            return Err(NetError::DuplicateRegistration(qualified));
        }

        self.mesh.join(&qualified).await?;
        self.validator.set_rules(&qualified, rules);
        self.topics.subscribe(&qualified);

        let mesh_sub = match self.mesh.subscribe(&qualified).await {
            Ok(sub) => sub,
            Err(e) => {
                // Roll back the partial registration before surfacing.
                self.validator.remove_rules(&qualified);
                self.topics.unsubscribe(&qualified);
                let _ = self.mesh.leave(&qualified).await;
                return Err(e);
            }
        };

        self.handlers.insert(qualified.clone(), handler);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Self::subscription_loop(
            Arc::clone(self),
            qualified.clone(),
            mesh_sub,
            stop_rx,
        ));
        self.loops.insert(qualified.clone(), (stop_tx, task));

        info!(topic = %qualified, "subscribed");
        Ok(Subscription {
            topic: qualified,
            pubsub: Arc::clone(self),
            done: AtomicBool::new(false),
        })
    }

    /// Tear down a subscription: handler map entry, validator rules, mesh
    /// subscription, topic refcount — in that order, idempotently.
    pub async fn unsubscribe(&self, qualified: &str) {
        let had_handler = self.handlers.remove(qualified).is_some();
        self.validator.remove_rules(qualified);

        if let Some((_, (stop_tx, task))) = self.loops.remove(qualified) {
            let _ = stop_tx.send(true);
            let _ = task.await;
        }
        let _ = self.mesh.leave(qualified).await;

        self.topics.unsubscribe(qualified);
        if had_handler {
            info!(topic = %qualified, "unsubscribed");
        }
    }

    /// Publish a payload to a topic.
    ///
    /// Returns an error only for pre-flight rejections: size cap and encode
    /// failure. Policy drops after that point (dedup, broadcast trouble on
    /// a best-effort mesh) are counted and logged, never surfaced —
    /// broadcast has no delivery acknowledgement to build an error out of.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        opts: PublishOptions,
    ) -> Result<(), NetError> {
        let qualified = qualify_topic_str(topic, self.namespace.as_deref())?;

        let limit = opts.max_size.unwrap_or(self.max_message_size);
        if payload.len() > limit {
            self.publisher.record_drop(&qualified);
            return Err(NetError::MessageTooLarge {
                size: payload.len(),
                max: limit,
            });
        }

        if let Err(rejection) = self.validator.check_outbound(&qualified, &payload) {
            self.publisher.record_drop(&qualified);
            debug!(topic = %qualified, %rejection, "publish dropped pre-flight");
            return Ok(());
        }

        let envelope = Envelope::new(qualified.clone(), payload.to_vec());
        let encoded = envelope.encode()?;

        let deadline = opts.timeout.unwrap_or(self.message_timeout);
        self.publisher
            .broadcast(&self.mesh, &qualified, Bytes::from(encoded), deadline)
            .await?;

        // Single-node special case: with at most one mesh peer there is no
        // mesh path that reliably echoes the message back, so deliver to
        // the local handler directly. The dedup cache absorbs any echo that
        // does arrive.
        if self.mesh.mesh_peers(&qualified).len() <= 1 {
            if let Some(handler) = self.handlers.get(&qualified).map(|h| Arc::clone(&h)) {
                let source = self.local_peer.clone();
                let topic_owned = qualified.clone();
                let payload_owned = payload.clone();
                tokio::spawn(async move {
                    dispatch(&handler, &topic_owned, source, payload_owned).await;
                });
            }
        }

        Ok(())
    }

    /// Stop every subscription loop and release every topic. Used by the
    /// facade on shutdown.
    pub async fn shutdown(&self) {
        let topics: Vec<String> = self.loops.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            self.unsubscribe(&topic).await;
        }
    }

    /// One long-lived loop per topic: read from the mesh until the
    /// subscription is cancelled or torn down.
    async fn subscription_loop(
        pubsub: Arc<PubSub>,
        topic: String,
        mut sub: MeshSubscription,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                msg = sub.next() => match msg {
                    Some(msg) => pubsub.handle_inbound(&topic, msg).await,
                    None => {
                        debug!(topic = %topic, "mesh subscription closed");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, topic: &str, msg: MeshMessage) {
        if let Err(e) = self.msg_limiter.check_message(&msg.source) {
            debug!(topic = %topic, source = %msg.source, error = %e, "inbound message rate-limited");
            return;
        }

        if let Err(rejection) = self.validator.check_inbound_raw(topic, &msg) {
            debug!(topic = %topic, source = %msg.source, %rejection, "inbound message rejected");
            return;
        }

        let envelope = match Envelope::decode(&msg.data) {
            Ok(env) => env,
            Err(e) => {
                warn!(topic = %topic, source = %msg.source, error = %e, "undecodable mesh message dropped");
                return;
            }
        };

        if let Err(rejection) = self.validator.check_inbound_payload(topic, &envelope.payload) {
            debug!(topic = %topic, source = %msg.source, %rejection, "inbound message rejected");
            return;
        }

        if envelope.channel != topic {
            warn!(
                topic = %topic,
                embedded = %envelope.channel,
                source = %msg.source,
                "mesh message embedded topic mismatch, dropped"
            );
            return;
        }

        let handler = match self.handlers.get(topic).map(|h| Arc::clone(&h)) {
            Some(h) => h,
            // Unsubscribe raced the loop teardown; nothing to deliver to.
            None => return,
        };

        dispatch(&handler, topic, msg.source, Bytes::from(envelope.payload)).await;
    }
}

/// Invoke a topic handler with the panic boundary applied. Handler errors
/// are logged and swallowed — they must never take the subscription loop
/// down with them.
async fn dispatch(handler: &TopicHandler, topic: &str, source: PeerId, payload: Bytes) {
    let fut = handler(source.clone(), payload);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %topic, source = %source, error = %e, "topic handler returned error");
        }
        Err(panic) => {
            let reason = panic_message(panic);
            error!(topic = %topic, source = %source, %reason, "topic handler panicked");
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned from [`PubSub::subscribe`]. Unsubscribing through it is
/// idempotent; dropping it without unsubscribing leaves the subscription
/// running (the facade's shutdown sweep still reclaims it).
pub struct Subscription {
    topic: String,
    pubsub: Arc<PubSub>,
    done: AtomicBool,
}

impl Subscription {
    /// The qualified topic string this subscription is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Tear the subscription down. Safe to call more than once.
    pub async fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pubsub.unsubscribe(&self.topic).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_TIMEOUT};
    use crate::substrate::memory::MemoryHub;
    use crate::substrate::{Blake3Hasher, PresencePolicy};
    use std::sync::atomic::AtomicUsize;

    fn build_pubsub(hub: &Arc<MemoryHub>, id: &str) -> Arc<PubSub> {
        let (_, mesh) = hub.add_node(id);
        let validator = MessageValidator::new(Arc::new(Blake3Hasher), Arc::new(PresencePolicy));
        PubSub::new(
            mesh,
            Arc::new(TopicManager::new()),
            validator,
            Arc::new(Publisher::new()),
            MessageLimiter::new(1000, Duration::from_secs(10)),
            None,
            DEFAULT_MAX_MESSAGE_SIZE,
            DEFAULT_MESSAGE_TIMEOUT,
            PeerId::new(id),
        )
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> TopicHandler {
        Arc::new(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn duplicate_subscription_fails() {
        let hub = MemoryHub::new();
        let pubsub = build_pubsub(&hub, "node-a");
        let counter = Arc::new(AtomicUsize::new(0));

        pubsub
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();
        let second = pubsub
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(counter))
            .await;
        assert!(matches!(second, Err(NetError::DuplicateRegistration(_))));
    }

    #[tokio::test]
    async fn oversize_publish_is_preflight_error() {
        let hub = MemoryHub::new();
        let pubsub = build_pubsub(&hub, "node-a");

        let result = pubsub
            .publish(
                "arc.test.chatter.v1",
                Bytes::from(vec![0u8; 10 * 1024 * 1024]),
                PublishOptions {
                    max_size: Some(1024 * 1024),
                    ..PublishOptions::default()
                },
            )
            .await;
        assert!(matches!(result, Err(NetError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn single_node_publish_loops_back_once() {
        let hub = MemoryHub::new();
        let pubsub = build_pubsub(&hub, "node-a");
        let counter = Arc::new(AtomicUsize::new(0));

        pubsub
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();

        pubsub
            .publish("arc.test.chatter.v1", Bytes::from_static(b"hello"), PublishOptions::default())
            .await
            .unwrap();

        // Loopback dispatch plus the mesh echo must collapse to one firing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_releases_topic() {
        let hub = MemoryHub::new();
        let pubsub = build_pubsub(&hub, "node-a");
        let counter = Arc::new(AtomicUsize::new(0));

        let sub = pubsub
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(counter))
            .await
            .unwrap();
        assert!(pubsub.topics.contains("arc.test.chatter.v1"));

        sub.unsubscribe().await;
        sub.unsubscribe().await;
        assert!(!pubsub.topics.contains("arc.test.chatter.v1"));

        // Topic is free for a fresh subscription.
        let counter2 = Arc::new(AtomicUsize::new(0));
        pubsub
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(counter2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_loop() {
        let hub = MemoryHub::new();
        let pub_a = build_pubsub(&hub, "node-a");
        let pub_b = build_pubsub(&hub, "node-b");
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        let handler: TopicHandler = Arc::new(move |_, payload: Bytes| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if payload.as_ref() == b"boom" {
                    panic!("handler exploded");
                }
                Ok(())
            }
            .boxed()
        });

        pub_a
            .subscribe("arc.test.chatter.v1", TopicRules::default(), handler)
            .await
            .unwrap();

        pub_b
            .publish("arc.test.chatter.v1", Bytes::from_static(b"boom"), PublishOptions::default())
            .await
            .unwrap();
        pub_b
            .publish("arc.test.chatter.v1", Bytes::from_static(b"fine"), PublishOptions::default())
            .await
            .unwrap();

        // The loop survived the panic and processed the second message.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cross_node_delivery_and_dedup() {
        let hub = MemoryHub::new();
        let pub_a = build_pubsub(&hub, "node-a");
        let pub_b = build_pubsub(&hub, "node-b");
        let counter = Arc::new(AtomicUsize::new(0));

        pub_a
            .subscribe("arc.test.chatter.v1", TopicRules::default(), counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();

        pub_b
            .publish("arc.test.chatter.v1", Bytes::from_static(b"block-7"), PublishOptions::default())
            .await
            .unwrap();
        pub_b
            .publish("arc.test.chatter.v1", Bytes::from_static(b"block-7"), PublishOptions::default())
            .await
            .unwrap();

        // Same payload twice within the dedup TTL: handler fires once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
