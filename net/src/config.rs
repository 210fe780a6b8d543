//! # Network Configuration & Constants
//!
//! Every tunable of the networking core lives here. If you're hardcoding a
//! timeout somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Two layers: compile-time constants (wire format, defaults) and the
//! [`NetworkConfig`] struct operators actually override. Defaults are chosen
//! for a mid-size mesh on commodity links; tune with care — several of these
//! interact (retry budget × backoff × read timeout bounds worst-case call
//! latency).

use std::time::Duration;

use crate::substrate::PeerId;

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// Frame preamble. Every Arclight frame on a raw stream starts with these two
/// bytes so peers can reject non-Arclight traffic without parsing further.
pub const FRAME_MAGIC: [u8; 2] = *b"AR";

/// Wire protocol version carried in byte 3 of the frame header. Bump on
/// breaking changes to the frame or envelope layout.
pub const WIRE_VERSION: u8 = 1;

/// Hard cap on a single frame's payload, applied on both encode and decode.
/// 16 MiB bounds per-stream memory no matter what a peer claims in the
/// length field.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Envelope schema version. Independent from [`WIRE_VERSION`] — the envelope
/// can grow fields without the frame layout changing.
pub const ENVELOPE_VERSION: u16 = 1;

/// Payloads larger than this get the compression hint set on their envelope.
/// The hint is advisory; the core never transforms payload bytes.
pub const COMPRESSION_HINT_THRESHOLD: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Leading segment of every Arclight pubsub topic string.
pub const TOPIC_ORG: &str = "arc";

/// Protocol ID prefix. Protocol IDs are hierarchical paths ending in a
/// semantic version, e.g. `/arc/sync/1.0.0`.
pub const PROTOCOL_PREFIX: &str = "/arc";

// ---------------------------------------------------------------------------
// Stream Transport Defaults
// ---------------------------------------------------------------------------

/// Time allowed to establish (or confirm) a connection before a call attempt
/// is abandoned. Life's too short for slow peers.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to write one request frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed to read one response frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry budget for transport-level failures. Application errors never retry.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay before the first retry. Grows by [`DEFAULT_BACKOFF_FACTOR`]
/// per attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff multiplier between retries.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Concurrent inbound handler invocations allowed per protocol before the
/// gate starts resetting streams instead of queuing.
pub const DEFAULT_INFLIGHT_PER_PROTOCOL: usize = 100;

/// How long a cached per-peer protocol preference stays valid before the
/// negotiator re-probes. Bounds how long a freshly upgraded peer keeps
/// being addressed on its legacy protocol ID.
pub const DEFAULT_PREFERENCE_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// PubSub Defaults
// ---------------------------------------------------------------------------

/// Default cap on a single pubsub message, pre-flight enforced. Topics can
/// override per-subscription.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Deadline for handing a message to the mesh primitive.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a message's content hash stays in the dedup cache.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(600);

/// Interval of the background sweep that purges expired dedup entries.
/// Memory stays bounded regardless of traffic volume.
pub const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Rate Limiting Defaults
// ---------------------------------------------------------------------------

/// Global cap on tracked inbound connections across all sources.
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;

/// Per-source-identity connection cap. A single identity hammering us does
/// not get to consume the global budget.
pub const DEFAULT_MAX_CONNECTIONS_PER_SOURCE: usize = 16;

/// Messages allowed per peer within [`DEFAULT_MESSAGE_RATE_WINDOW`].
pub const DEFAULT_MESSAGE_RATE_CAP: u32 = 200;

/// Sliding window for the per-peer message rate counter.
pub const DEFAULT_MESSAGE_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Interval of the limiter background sweeps.
pub const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Connection Maintenance Defaults
// ---------------------------------------------------------------------------

/// Minimum quiet period between forceConnect rounds. Repeated triggers
/// inside the window coalesce into no-ops — no dial storms.
pub const DEFAULT_FORCE_CONNECT_COOLDOWN: Duration = Duration::from_secs(120);

/// Worker concurrency for a dialing round.
pub const DEFAULT_FORCE_CONNECT_CONCURRENCY: usize = 15;

/// Total dial budget per round, across all tiers.
pub const DEFAULT_FORCE_CONNECT_BUDGET: usize = 50;

/// Sub-budget for the Tier-2 random sample of the known-peer set.
pub const DEFAULT_TIER2_SAMPLE_BUDGET: usize = 10;

/// Per-dial timeout inside a round.
pub const DEFAULT_FORCE_CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Operator-supplied configuration for the networking facade.
///
/// Read-only after construction, except for the maintainer's live peer-list
/// updates which go through [`crate::maintain::Maintainer::update_peers`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Deployment namespace, e.g. `testnet-7`. When set, protocol IDs and
    /// topics get a namespace-qualified form; the unqualified original is
    /// kept registered for peers that have not upgraded. `None` disables
    /// qualification entirely.
    pub namespace: Option<String>,
    /// Pre-flight cap on outbound pubsub messages.
    pub max_message_size: usize,
    /// Deadline for handing a message to the mesh primitive.
    pub message_timeout: Duration,
    /// Dedup cache TTL for pubsub messages.
    pub dedup_ttl: Duration,
    /// Stream call defaults; individual calls can override.
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    /// Inbound handler concurrency per protocol.
    pub inflight_per_protocol: usize,
    /// Negotiator preference cache TTL.
    pub preference_ttl: Duration,
    /// Connection limiter caps.
    pub max_connections: usize,
    pub max_connections_per_source: usize,
    /// Message limiter cap and window.
    pub message_rate_cap: u32,
    pub message_rate_window: Duration,
    /// Active mesh pull-up policy.
    pub force_connect: ForceConnectConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            inflight_per_protocol: DEFAULT_INFLIGHT_PER_PROTOCOL,
            preference_ttl: DEFAULT_PREFERENCE_TTL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_source: DEFAULT_MAX_CONNECTIONS_PER_SOURCE,
            message_rate_cap: DEFAULT_MESSAGE_RATE_CAP,
            message_rate_window: DEFAULT_MESSAGE_RATE_WINDOW,
            force_connect: ForceConnectConfig::default(),
        }
    }
}

/// Policy for the active connection maintainer ("forceConnect").
///
/// `business_peers` are operator-designated must-stay-connected peers —
/// Tier 0, dialed first every round. `bootstrap_peers` are Tier 1.
#[derive(Debug, Clone)]
pub struct ForceConnectConfig {
    pub enabled: bool,
    pub cooldown: Duration,
    pub concurrency: usize,
    pub budget_per_round: usize,
    pub tier2_sample_budget: usize,
    pub dial_timeout: Duration,
    pub business_peers: Vec<PeerId>,
    pub bootstrap_peers: Vec<PeerId>,
}

impl Default for ForceConnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: DEFAULT_FORCE_CONNECT_COOLDOWN,
            concurrency: DEFAULT_FORCE_CONNECT_CONCURRENCY,
            budget_per_round: DEFAULT_FORCE_CONNECT_BUDGET,
            tier2_sample_budget: DEFAULT_TIER2_SAMPLE_BUDGET,
            dial_timeout: DEFAULT_FORCE_CONNECT_DIAL_TIMEOUT,
            business_peers: Vec::new(),
            bootstrap_peers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_magic_is_ascii() {
        assert!(FRAME_MAGIC.iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn timing_defaults_sanity() {
        // Worst-case call latency must stay finite and the retry budget must
        // not dwarf the per-phase timeouts. Obvious, but stranger things have
        // shipped to production.
        assert!(DEFAULT_RETRY_DELAY < DEFAULT_READ_TIMEOUT);
        assert!(DEFAULT_BACKOFF_FACTOR >= 1.0);
        assert!(DEFAULT_MAX_RETRIES > 0);
    }

    #[test]
    fn size_defaults_sanity() {
        assert!(DEFAULT_MAX_MESSAGE_SIZE <= MAX_FRAME_SIZE);
        assert!(COMPRESSION_HINT_THRESHOLD < DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn force_connect_budgets_nest() {
        let cfg = ForceConnectConfig::default();
        assert!(cfg.tier2_sample_budget <= cfg.budget_per_round);
        assert!(cfg.concurrency > 0);
    }
}
