//! End-to-end integration tests for the Arclight network core.
//!
//! These tests exercise whole multi-node scenarios over the in-process
//! substrate: RPC round trips, namespace fallback negotiation, pubsub
//! delivery with validation and dedup, and tiered connection maintenance.
//! They prove the components compose — facade, registry, negotiator,
//! stream transport, pubsub pipeline, and maintainer working against the
//! same hub.
//!
//! Each test stands alone with its own hub and facades. No shared state,
//! no test ordering dependencies, no flaky failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;

use arclight_net::config::{ForceConnectConfig, NetworkConfig};
use arclight_net::facade::Network;
use arclight_net::gossip::PublishOptions;
use arclight_net::maintain::TriggerReason;
use arclight_net::registry::ProtocolHandler;
use arclight_net::stream::CallOptions;
use arclight_net::substrate::memory::MemoryHub;
use arclight_net::substrate::PeerId;
use arclight_net::topic::Topic;
use arclight_net::{NetError, TopicHandler, TopicRules};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Spin up a facade on the hub with the given namespace.
fn node(hub: &Arc<MemoryHub>, id: &str, namespace: Option<&str>) -> Arc<Network> {
    node_with_config(hub, id, |cfg| {
        cfg.namespace = namespace.map(String::from);
    })
}

fn node_with_config(
    hub: &Arc<MemoryHub>,
    id: &str,
    tweak: impl FnOnce(&mut NetworkConfig),
) -> Arc<Network> {
    let (host, mesh) = hub.add_node(id);
    let mut cfg = NetworkConfig {
        retry_delay: Duration::from_millis(10),
        ..NetworkConfig::default()
    };
    tweak(&mut cfg);
    Network::new(cfg, host, mesh)
}

fn pong_handler() -> ProtocolHandler {
    Arc::new(|_, _| async { Ok(Bytes::from_static(b"pong")) }.boxed())
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

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rpc_happy_path() {
    let hub = MemoryHub::new();
    let client = node(&hub, "client", Some("devnet"));
    let server = node(&hub, "server", Some("devnet"));

    server
        .register_protocol("/arc/feature/1.0.0", pong_handler())
        .unwrap();

    let response = client
        .call(
            &PeerId::new("server"),
            "/arc/feature/1.0.0",
            Bytes::from_static(b"ping"),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.as_ref(), b"pong");
}

#[tokio::test]
async fn qualified_call_falls_back_then_sticks() {
    let hub = MemoryHub::new();
    // Client runs namespaced; server is a legacy node with no namespace,
    // so only the original protocol ID exists on its side.
    let client = node(&hub, "client", Some("testnet-7"));
    let server = node(&hub, "server", None);

    server
        .register_protocol("/arc/feature/1.0.0", pong_handler())
        .unwrap();

    // First call: qualified open fails, fallback to the original succeeds.
    let response = client
        .call(
            &PeerId::new("server"),
            "/arc/feature/1.0.0",
            Bytes::from_static(b"ping"),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.as_ref(), b"pong");

    // Second call: the cached preference goes straight to the original.
    client
        .call(
            &PeerId::new("server"),
            "/arc/feature/1.0.0",
            Bytes::from_static(b"ping"),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let diag = client.diagnostics();
    assert_eq!(diag.negotiator.avoided_fallbacks, 1);
    assert_eq!(diag.preferences.len(), 1);
    assert_eq!(diag.preferences[0].fallback_count, 1);
    assert_eq!(diag.preferences[0].success_count, 2);
}

#[tokio::test]
async fn call_to_unknown_peer_exhausts_retries() {
    let hub = MemoryHub::new();
    let client = node(&hub, "client", None);

    let result = client
        .call(
            &PeerId::new("nobody"),
            "/arc/feature/1.0.0",
            Bytes::from_static(b"ping"),
            CallOptions {
                max_retries: Some(1),
                retry_delay: Some(Duration::from_millis(1)),
                ..CallOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(NetError::Io(_))));
}

// ---------------------------------------------------------------------------
// PubSub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_reaches_subscriber_across_namespace_paths() {
    let hub = MemoryHub::new();
    let publisher = node(&hub, "publisher", Some("devnet"));
    let subscriber = node(&hub, "subscriber", Some("devnet"));

    let counter = Arc::new(AtomicUsize::new(0));
    subscriber
        .subscribe(
            &Topic::new("consensus", "blocks", "v1"),
            TopicRules::default(),
            counting_handler(Arc::clone(&counter)),
        )
        .await
        .unwrap();

    // The publisher names the topic unqualified; qualification is applied
    // exactly once on each path, so both sides land on the same mesh topic.
    publisher
        .publish(
            &Topic::new("consensus", "blocks", "v1"),
            Bytes::from_static(b"block-42"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversize_publish_never_reaches_the_mesh() {
    let hub = MemoryHub::new();
    let publisher = node(&hub, "publisher", None);
    let subscriber = node(&hub, "subscriber", None);

    let counter = Arc::new(AtomicUsize::new(0));
    subscriber
        .subscribe(
            &Topic::new("consensus", "blocks", "v1"),
            TopicRules::default(),
            counting_handler(Arc::clone(&counter)),
        )
        .await
        .unwrap();

    let result = publisher
        .publish(
            &Topic::new("consensus", "blocks", "v1"),
            Bytes::from(vec![0u8; 10 * 1024 * 1024]),
            PublishOptions {
                max_size: Some(1024 * 1024),
                ..PublishOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(NetError::MessageTooLarge { .. })));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_payload_fires_handler_once() {
    let hub = MemoryHub::new();
    let publisher = node(&hub, "publisher", None);
    let subscriber = node(&hub, "subscriber", None);

    let counter = Arc::new(AtomicUsize::new(0));
    subscriber
        .subscribe(
            &Topic::new("consensus", "blocks", "v1"),
            TopicRules::default(),
            counting_handler(Arc::clone(&counter)),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        publisher
            .publish(
                &Topic::new("consensus", "blocks", "v1"),
                Bytes::from_static(b"block-42"),
                PublishOptions::default(),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let hub = MemoryHub::new();
    let publisher = node(&hub, "publisher", None);
    let subscriber = node(&hub, "subscriber", None);

    let counter = Arc::new(AtomicUsize::new(0));
    let sub = subscriber
        .subscribe(
            &Topic::new("consensus", "blocks", "v1"),
            TopicRules::default(),
            counting_handler(Arc::clone(&counter)),
        )
        .await
        .unwrap();

    sub.unsubscribe().await;

    publisher
        .publish(
            &Topic::new("consensus", "blocks", "v1"),
            Bytes::from_static(b"block-42"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert!(subscriber.topics().is_empty());
}

// ---------------------------------------------------------------------------
// Connection Maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn maintenance_round_respects_tiering_and_budget() {
    let hub = MemoryHub::new();
    let net = node_with_config(&hub, "local", |cfg| {
        cfg.force_connect = ForceConnectConfig {
            budget_per_round: 2,
            tier2_sample_budget: 10,
            business_peers: vec![PeerId::new("biz-1")],
            bootstrap_peers: vec![PeerId::new("boot-1"), PeerId::new("boot-2")],
            ..ForceConnectConfig::default()
        };
    });

    hub.add_passive_peer("biz-1");
    hub.add_passive_peer("boot-1");
    hub.add_passive_peer("boot-2");
    for i in 0..50 {
        hub.add_passive_peer(format!("peer-{}", i));
    }

    net.start().await;
    net.trigger_maintenance(TriggerReason::Manual);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dialed: Vec<PeerId> = hub.dials().into_iter().map(|(_, to)| to).collect();
    assert_eq!(dialed.len(), 2);
    assert!(dialed.contains(&PeerId::new("biz-1")));
    assert!(dialed.iter().any(|p| p.as_str().starts_with("boot-")));

    net.stop().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_shutdown_releases_everything() {
    let hub = MemoryHub::new();
    let net = node(&hub, "node-a", None);
    net.start().await;

    net.register_protocol("/arc/feature/1.0.0", pong_handler()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    net.subscribe(
        &Topic::new("consensus", "blocks", "v1"),
        TopicRules::default(),
        counting_handler(counter),
    )
    .await
    .unwrap();

    net.stop().await;

    assert!(net.topics().is_empty());
    assert!(matches!(
        net.publish(
            &Topic::new("consensus", "blocks", "v1"),
            Bytes::from_static(b"late"),
            PublishOptions::default(),
        )
        .await,
        Err(NetError::Shutdown)
    ));
}
