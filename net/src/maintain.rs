//! # Connection Maintainer ("forceConnect")
//!
//! Passive discovery keeps a node *findable*; it does not keep the node
//! *attached*. This loop actively dials a budgeted, tiered set of candidate
//! peers so the local node stays on the broadcast mesh even when discovery
//! is weak or partial — without ever turning into a dial storm.
//!
//! Mechanics: a small bounded channel coalesces trigger reasons into one
//! pending round, and a cooldown window turns repeated triggers into no-ops.
//! Per round, candidates are assembled in strict tier order and capped by a
//! global budget:
//!
//! 1. Tier 0 — operator-designated business-critical peers
//! 2. Tier 1 — bootstrap peers
//! 3. Tier 1.5 — peers already in a joined topic's mesh
//! 4. Tier 2 — a bounded random sample of the whole known-peer set
//!
//! Each tier is filtered (self, already-connected, address-less) before it
//! spends budget. Dialing runs with bounded worker concurrency and a
//! per-dial timeout; the round's outcome is one log summary, not an API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ForceConnectConfig;
use crate::substrate::{Connectedness, HostTransport, MeshNetwork, PeerId};
use crate::topic::TopicManager;

/// Capacity of the trigger channel. Small on purpose: multiple triggers
/// while a round is pending collapse into one.
const TRIGGER_CHANNEL_CAPACITY: usize = 4;

/// Why a round was requested. Logged with the round summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Startup,
    PeerDropped,
    Periodic,
    Manual,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerReason::Startup => "startup",
            TriggerReason::PeerDropped => "peer-dropped",
            TriggerReason::Periodic => "periodic",
            TriggerReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Candidate tier, in dial-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Business,
    Bootstrap,
    Mesh,
    Sampled,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::Business => "business",
            Tier::Bootstrap => "bootstrap",
            Tier::Mesh => "mesh",
            Tier::Sampled => "sampled",
        }
    }
}

/// Outcome of one dialing round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

/// Aggregate maintainer counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct MaintainerStats {
    pub rounds: u64,
    pub dials_succeeded: u64,
    pub dials_failed: u64,
}

/// The forceConnect loop and its policy.
pub struct Maintainer {
    host: Arc<dyn HostTransport>,
    mesh: Arc<dyn MeshNetwork>,
    topics: Arc<TopicManager>,
    cfg: RwLock<ForceConnectConfig>,
    trigger_tx: mpsc::Sender<TriggerReason>,
    trigger_rx: Mutex<Option<mpsc::Receiver<TriggerReason>>>,
    last_round: Mutex<Option<Instant>>,
    rounds: AtomicU64,
    dials_succeeded: AtomicU64,
    dials_failed: AtomicU64,
}

impl Maintainer {
    pub fn new(
        host: Arc<dyn HostTransport>,
        mesh: Arc<dyn MeshNetwork>,
        topics: Arc<TopicManager>,
        cfg: ForceConnectConfig,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        Arc::new(Self {
            host,
            mesh,
            topics,
            cfg: RwLock::new(cfg),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            last_round: Mutex::new(None),
            rounds: AtomicU64::new(0),
            dials_succeeded: AtomicU64::new(0),
            dials_failed: AtomicU64::new(0),
        })
    }

    /// Request a round. Never blocks: when the channel is full a round is
    /// already pending and this trigger rides along with it.
    pub fn trigger(&self, reason: TriggerReason) {
        if self.trigger_tx.try_send(reason).is_err() {
            trace!(%reason, "maintenance already pending, trigger coalesced");
        }
    }

    /// Replace the business/bootstrap peer lists at runtime. The next round
    /// sees the new lists; nothing else in the config is touched.
    pub fn update_peers(&self, business: Vec<PeerId>, bootstrap: Vec<PeerId>) {
        let mut cfg = self.cfg.write();
        cfg.business_peers = business;
        cfg.bootstrap_peers = bootstrap;
    }

    pub fn stats(&self) -> MaintainerStats {
        MaintainerStats {
            rounds: self.rounds.load(Ordering::Relaxed),
            dials_succeeded: self.dials_succeeded.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
        }
    }

    /// Spawn the maintenance loop. Call once; the returned handle ends when
    /// the shutdown watch fires.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let maintainer = Arc::clone(self);
        let mut rx = self
            .trigger_rx
            .lock()
            .take()
            .expect("maintainer started twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    reason = rx.recv() => match reason {
                        Some(reason) => {
                            maintainer.run_once(reason).await;
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        debug!("maintenance loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Run one round now, honoring the enabled flag and the cooldown.
    /// Returns `None` when the round was skipped.
    pub async fn run_once(&self, reason: TriggerReason) -> Option<RoundSummary> {
        let cfg = self.cfg.read().clone();
        if !cfg.enabled {
            return None;
        }

        {
            let mut last = self.last_round.lock();
            if let Some(at) = *last {
                if at.elapsed() < cfg.cooldown {
                    debug!(%reason, cooldown_secs = cfg.cooldown.as_secs(), "maintenance within cooldown, skipped");
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        let summary = self.run_round(&cfg, reason).await;
        self.rounds.fetch_add(1, Ordering::Relaxed);
        Some(summary)
    }

    async fn run_round(&self, cfg: &ForceConnectConfig, reason: TriggerReason) -> RoundSummary {
        let started = Instant::now();
        let (candidates, skipped) = self.gather_candidates(cfg);
        let attempted = candidates.len();

        let results: Vec<bool> = stream::iter(candidates)
            .map(|(tier, peer)| {
                let host = Arc::clone(&self.host);
                let dial_timeout = cfg.dial_timeout;
                async move {
                    let outcome = tokio::time::timeout(dial_timeout, host.dial(&peer)).await;
                    match outcome {
                        Ok(Ok(())) => {
                            match tier {
                                Tier::Business => info!(peer = %peer, tier = tier.label(), "maintenance dial connected"),
                                Tier::Bootstrap => info!(peer = %peer, tier = tier.label(), "maintenance dial connected"),
                                _ => debug!(peer = %peer, tier = tier.label(), "maintenance dial connected"),
                            }
                            true
                        }
                        Ok(Err(e)) => {
                            match tier {
                                Tier::Business => warn!(peer = %peer, tier = tier.label(), error = %e, "maintenance dial failed"),
                                _ => debug!(peer = %peer, tier = tier.label(), error = %e, "maintenance dial failed"),
                            }
                            false
                        }
                        Err(_) => {
                            match tier {
                                Tier::Business => warn!(peer = %peer, tier = tier.label(), "maintenance dial timed out"),
                                _ => debug!(peer = %peer, tier = tier.label(), "maintenance dial timed out"),
                            }
                            false
                        }
                    }
                }
            })
            .buffer_unordered(cfg.concurrency.max(1))
            .collect()
            .await;

        let succeeded = results.iter().filter(|ok| **ok).count();
        let failed = attempted - succeeded;
        self.dials_succeeded.fetch_add(succeeded as u64, Ordering::Relaxed);
        self.dials_failed.fetch_add(failed as u64, Ordering::Relaxed);

        let summary = RoundSummary {
            attempted,
            succeeded,
            failed,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            %reason,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "maintenance round complete"
        );
        summary
    }

    /// Assemble the round's candidates in strict tier order, deduplicated,
    /// filtered, and capped by the per-round budget. Returns the candidates
    /// and how many otherwise-eligible peers the budget excluded.
    fn gather_candidates(&self, cfg: &ForceConnectConfig) -> (Vec<(Tier, PeerId)>, usize) {
        let local = self.host.local_peer();
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut candidates: Vec<(Tier, PeerId)> = Vec::new();
        let mut skipped = 0usize;

        let admit = |tier: Tier, peer: PeerId, candidates: &mut Vec<(Tier, PeerId)>, seen: &mut HashSet<PeerId>, skipped: &mut usize| {
            if peer == local
                || !seen.insert(peer.clone())
                || self.host.connectedness(&peer) == Connectedness::Connected
                || self.host.addresses(&peer).is_empty()
            {
                return;
            }
            if candidates.len() >= cfg.budget_per_round {
                *skipped += 1;
                return;
            }
            candidates.push((tier, peer));
        };

        for peer in &cfg.business_peers {
            admit(Tier::Business, peer.clone(), &mut candidates, &mut seen, &mut skipped);
        }
        for peer in &cfg.bootstrap_peers {
            admit(Tier::Bootstrap, peer.clone(), &mut candidates, &mut seen, &mut skipped);
        }
        for topic in self.topics.list() {
            for peer in self.mesh.mesh_peers(&topic.topic) {
                admit(Tier::Mesh, peer, &mut candidates, &mut seen, &mut skipped);
            }
        }

        // Tier 2: bounded random sample of everything the peerstore knows,
        // to help organic mesh growth without flooding.
        let mut known = self.host.known_peers();
        known.shuffle(&mut rand::thread_rng());
        for peer in known.into_iter().take(cfg.tier2_sample_budget) {
            admit(Tier::Sampled, peer, &mut candidates, &mut seen, &mut skipped);
        }

        (candidates, skipped)
    }
}
