//! # Protocol Negotiation Cache
//!
//! During a namespace migration window every protocol exists under two IDs:
//! the namespace-qualified form and the original. Probing a peer that only
//! speaks one of them costs a failed stream-open on every call — this cache
//! remembers, per peer, which form worked last, so steady-state calls go
//! straight to the right ID.
//!
//! The state machine is deliberately tiny: `Unknown → Qualified | Original`
//! on a recorded outcome, and back to `Unknown` when the entry's TTL
//! expires. The TTL is what makes rolling upgrades safe — a peer that
//! upgrades to the qualified form gets re-probed within one TTL instead of
//! being stuck on the legacy path forever.
//!
//! This module decides IDs only; it performs no I/O. The stream transport
//! feeds outcomes back through [`Negotiator::record_result`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::substrate::PeerId;

/// Which protocol ID form a peer is known to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolPreference {
    Unknown,
    Qualified,
    Original,
}

/// What the transport should try for one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// ID to open the stream with.
    pub primary: String,
    /// Alternate ID to retry once when the primary fails to open. `None`
    /// when the preference is settled and probing would be wasted work.
    pub fallback: Option<String>,
}

struct PrefEntry {
    preference: ProtocolPreference,
    last_updated: Instant,
    success_count: u64,
    fallback_count: u64,
}

/// Diagnostics snapshot of one peer's cached preference.
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceInfo {
    pub peer: String,
    pub preference: ProtocolPreference,
    pub age_secs: u64,
    pub success_count: u64,
    pub fallback_count: u64,
}

/// Aggregate negotiator counters.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiatorStats {
    pub cached_peers: usize,
    /// Calls that skipped probing because a preference was cached.
    pub avoided_fallbacks: u64,
}

/// Per-peer protocol preference cache with TTL.
pub struct Negotiator {
    cache: DashMap<PeerId, PrefEntry>,
    ttl: Duration,
    avoided_fallbacks: AtomicU64,
}

impl Negotiator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            avoided_fallbacks: AtomicU64::new(0),
        }
    }

    /// Choose the ID(s) for a call to `peer`.
    ///
    /// With no namespace in play (`original == qualified`) the original is
    /// always used and there is nothing to negotiate. Otherwise a cached,
    /// unexpired preference picks its ID directly with no fallback; an
    /// unknown peer is probed optimistically with the qualified form and a
    /// one-shot fallback to the original.
    pub fn select(&self, peer: &PeerId, original: &str, qualified: &str) -> Selection {
        if original == qualified {
            return Selection {
                primary: original.to_string(),
                fallback: None,
            };
        }

        match self.current_preference(peer) {
            ProtocolPreference::Qualified => {
                self.avoided_fallbacks.fetch_add(1, Ordering::Relaxed);
                Selection {
                    primary: qualified.to_string(),
                    fallback: None,
                }
            }
            ProtocolPreference::Original => {
                self.avoided_fallbacks.fetch_add(1, Ordering::Relaxed);
                Selection {
                    primary: original.to_string(),
                    fallback: None,
                }
            }
            ProtocolPreference::Unknown => Selection {
                primary: qualified.to_string(),
                fallback: Some(original.to_string()),
            },
        }
    }

    /// Record a call outcome: which ID form ultimately opened the stream,
    /// and whether the fallback path was taken to get there.
    pub fn record_result(&self, peer: &PeerId, used_qualified: bool, fell_back: bool) {
        let preference = if used_qualified {
            ProtocolPreference::Qualified
        } else {
            ProtocolPreference::Original
        };

        let mut entry = self.cache.entry(peer.clone()).or_insert_with(|| PrefEntry {
            preference: ProtocolPreference::Unknown,
            last_updated: Instant::now(),
            success_count: 0,
            fallback_count: 0,
        });
        if entry.preference != preference {
            debug!(peer = %peer, ?preference, "protocol preference updated");
        }
        entry.preference = preference;
        entry.last_updated = Instant::now();
        entry.success_count += 1;
        if fell_back {
            entry.fallback_count += 1;
        }
    }

    /// Cached preference, with TTL expiry applied at read time. Expired
    /// entries revert to `Unknown` and are dropped so the peer is re-probed.
    fn current_preference(&self, peer: &PeerId) -> ProtocolPreference {
        let expired = match self.cache.get(peer) {
            Some(entry) => {
                if entry.last_updated.elapsed() <= self.ttl {
                    return entry.preference;
                }
                true
            }
            None => false,
        };
        if expired {
            self.cache.remove(peer);
        }
        ProtocolPreference::Unknown
    }

    pub fn stats(&self) -> NegotiatorStats {
        NegotiatorStats {
            cached_peers: self.cache.len(),
            avoided_fallbacks: self.avoided_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Per-peer snapshot for the diagnostics surface.
    pub fn snapshot(&self) -> Vec<PreferenceInfo> {
        let mut infos: Vec<PreferenceInfo> = self
            .cache
            .iter()
            .map(|entry| PreferenceInfo {
                peer: entry.key().to_string(),
                preference: entry.preference,
                age_secs: entry.last_updated.elapsed().as_secs(),
                success_count: entry.success_count,
                fallback_count: entry.fallback_count,
            })
            .collect();
        infos.sort_by(|a, b| a.peer.cmp(&b.peer));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL: &str = "/arc/sync/1.0.0";
    const QUALIFIED: &str = "/testnet-7/arc/sync/1.0.0";

    fn peer() -> PeerId {
        PeerId::new("peer-1")
    }

    #[test]
    fn equal_ids_short_circuit() {
        let neg = Negotiator::new(Duration::from_secs(300));
        let sel = neg.select(&peer(), ORIGINAL, ORIGINAL);
        assert_eq!(sel.primary, ORIGINAL);
        assert!(sel.fallback.is_none());
    }

    #[test]
    fn unknown_peer_probes_qualified_with_fallback() {
        let neg = Negotiator::new(Duration::from_secs(300));
        let sel = neg.select(&peer(), ORIGINAL, QUALIFIED);
        assert_eq!(sel.primary, QUALIFIED);
        assert_eq!(sel.fallback.as_deref(), Some(ORIGINAL));
    }

    #[test]
    fn recorded_preference_skips_probing() {
        let neg = Negotiator::new(Duration::from_secs(300));
        neg.record_result(&peer(), false, true);

        let sel = neg.select(&peer(), ORIGINAL, QUALIFIED);
        assert_eq!(sel.primary, ORIGINAL);
        assert!(sel.fallback.is_none());
        assert_eq!(neg.stats().avoided_fallbacks, 1);
    }

    #[test]
    fn qualified_success_pins_qualified() {
        let neg = Negotiator::new(Duration::from_secs(300));
        neg.record_result(&peer(), true, false);

        let sel = neg.select(&peer(), ORIGINAL, QUALIFIED);
        assert_eq!(sel.primary, QUALIFIED);
        assert!(sel.fallback.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn preference_expires_back_to_unknown() {
        let neg = Negotiator::new(Duration::from_secs(300));
        neg.record_result(&peer(), false, true);

        // Still inside the TTL: settled on the original form.
        tokio::time::advance(Duration::from_secs(200)).await;
        let sel = neg.select(&peer(), ORIGINAL, QUALIFIED);
        assert_eq!(sel.primary, ORIGINAL);
        assert!(sel.fallback.is_none());

        // Past the TTL: back to probing, so an upgraded peer gets noticed.
        tokio::time::advance(Duration::from_secs(101)).await;
        let sel = neg.select(&peer(), ORIGINAL, QUALIFIED);
        assert_eq!(sel.primary, QUALIFIED);
        assert_eq!(sel.fallback.as_deref(), Some(ORIGINAL));
    }

    #[test]
    fn counters_accumulate() {
        let neg = Negotiator::new(Duration::from_secs(300));
        neg.record_result(&peer(), false, true);
        neg.record_result(&peer(), false, false);

        let snapshot = neg.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].success_count, 2);
        assert_eq!(snapshot[0].fallback_count, 1);
        assert_eq!(snapshot[0].preference, ProtocolPreference::Original);
    }
}
