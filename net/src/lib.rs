// Copyright (c) 2026 Arclight Labs. MIT License.
// See LICENSE for details.

//! # Arclight Network Core
//!
//! The communication layer of an Arclight node: protocol registration and
//! version negotiation, reliable request/response streaming, gossip-style
//! publish/subscribe, and active connection maintenance — all on top of an
//! unreliable, dynamically-connected peer mesh, and all without blocking
//! the rest of the node.
//!
//! The underlying P2P host (dialing, discovery, NAT traversal, peerstore)
//! and the topic-mesh broadcast primitive are consumed through the narrow
//! traits in [`substrate`]; everything above them is transport-agnostic.
//!
//! ## Architecture
//!
//! ```text
//! facade.rs     — single entry point composing all of the below
//! stream.rs     — RPC over raw streams: timeouts, retries, backpressure
//! gossip/       — pubsub transport, per-topic validation, publish stats
//! maintain.rs   — tiered, budgeted mesh pull-up dialing ("forceConnect")
//! registry.rs   — protocol ID → handler map with strict registration
//! negotiate.rs  — per-peer qualified/original protocol preference cache
//! topic.rs      — structured topics and refcounted subscriptions
//! ratelimit.rs  — connection and message rate limiters
//! gate.rs       — per-protocol inbound concurrency semaphore
//! wire/         — frame codec and envelope types
//! substrate/    — transport traits + in-process implementation
//! ```
//!
//! ## Design Decisions
//!
//! - Every registry, cache, and counter is an owned structure behind its
//!   own lock, mutated only through methods. No package-level state.
//! - Retryability lives on the error type. The retry loop and callers read
//!   the same `is_retryable()` — one source of truth.
//! - Namespace qualification of protocol IDs and topics is a pure,
//!   idempotent transform applied at most once per send/receive path.
//! - Cancellation is structural: per-phase `tokio::time::timeout`s, watch
//!   channels for task shutdown, and future-drop for caller abandonment.

pub mod config;
pub mod error;
pub mod facade;
pub mod gate;
pub mod gossip;
pub mod maintain;
pub mod negotiate;
pub mod ratelimit;
pub mod registry;
pub mod stream;
pub mod substrate;
pub mod topic;
pub mod wire;

pub use config::{ForceConnectConfig, NetworkConfig};
pub use error::NetError;
pub use facade::{Diagnostics, Network};
pub use gossip::validator::TopicRules;
pub use gossip::{PublishOptions, Subscription, TopicHandler};
pub use maintain::TriggerReason;
pub use registry::{ProtocolHandler, ProtocolInfo};
pub use stream::CallOptions;
pub use substrate::{HostTransport, MeshNetwork, PeerId};
pub use topic::Topic;
