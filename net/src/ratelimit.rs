//! # Connection & Message Rate Limiters
//!
//! Two small defenses against noisy peers:
//!
//! - [`ConnectionLimiter`] caps tracked inbound connections, globally and
//!   per source identity. Checked before a stream is accepted; a rejection
//!   resets the stream before any handler work happens.
//! - [`MessageLimiter`] keeps a sliding time-window of message timestamps
//!   per peer and rejects the peer's messages once the window fills.
//!
//! Both run a background sweeper on a fixed interval so idle entries do not
//! accumulate forever, and both expose an explicit [`stop`] — required for
//! clean shutdown and for test isolation (a leaked sweeper task outliving
//! its test is a debugging session nobody wants twice).
//!
//! [`stop`]: ConnectionLimiter::stop

use std::collections::HashMap;
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

use crate::config::LIMITER_SWEEP_INTERVAL;
use crate::error::NetError;
use crate::substrate::PeerId;

// ---------------------------------------------------------------------------
// Connection Limiter
// ---------------------------------------------------------------------------

/// Aggregate limiter counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub tracked_entries: usize,
    pub active_total: usize,
    pub rejected_total: u64,
}

/// Caps tracked connections globally and per source identity.
pub struct ConnectionLimiter {
    /// Source identity → live connection count. One mutex keeps the global
    /// sum exact at the cap boundary.
    counts: Mutex<HashMap<String, usize>>,
    max_total: usize,
    max_per_source: usize,
    rejected: AtomicU64,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_source: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            counts: Mutex::new(HashMap::new()),
            max_total,
            max_per_source,
            rejected: AtomicU64::new(0),
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    /// Admit or reject a new connection from `source`, counting it on
    /// admission.
    pub fn check_connection(&self, source: &PeerId) -> Result<(), NetError> {
        let mut counts = self.counts.lock();
        let total: usize = counts.values().sum();
        if total >= self.max_total {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::RateLimited(format!(
                "global connection cap {} reached",
                self.max_total
            )));
        }
        let count = counts.entry(source.to_string()).or_insert(0);
        if *count >= self.max_per_source {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::RateLimited(format!(
                "per-source connection cap {} reached for {}",
                self.max_per_source, source
            )));
        }
        *count += 1;
        Ok(())
    }

    /// Release one connection from `source`. Safe to call for an identity
    /// that was never admitted — that is a no-op, not a panic.
    pub fn remove_connection(&self, source: &PeerId) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(source.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(source.as_str());
            }
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let counts = self.counts.lock();
        LimiterStats {
            tracked_entries: counts.len(),
            active_total: counts.values().sum(),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background sweeper. Idempotent — a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let limiter = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut counts = limiter.counts.lock();
                        let before = counts.len();
                        counts.retain(|_, count| *count > 0);
                        let swept = before - counts.len();
                        if swept > 0 {
                            trace!(swept, "connection limiter swept idle entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("connection limiter sweeper stopped");
                        return;
                    }
                }
            }
        }));
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Message Limiter
// ---------------------------------------------------------------------------

/// Sliding-window message rate limiter, per peer.
pub struct MessageLimiter {
    windows: DashMap<PeerId, Vec<Instant>>,
    cap: u32,
    window: Duration,
    rejected: AtomicU64,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MessageLimiter {
    pub fn new(cap: u32, window: Duration) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            windows: DashMap::new(),
            cap,
            window,
            rejected: AtomicU64::new(0),
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    /// Admit or reject one message from `peer`. Prunes the peer's window,
    /// rejects if it is already full, records the message otherwise.
    pub fn check_message(&self, peer: &PeerId) -> Result<(), NetError> {
        let now = Instant::now();
        let mut window = self.windows.entry(peer.clone()).or_default();
        window.retain(|t| now.duration_since(*t) <= self.window);
        if window.len() >= self.cap as usize {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::RateLimited(format!(
                "peer {} over {} messages per {:?}",
                peer, self.cap, self.window
            )));
        }
        window.push(now);
        Ok(())
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            tracked_entries: self.windows.len(),
            active_total: self.windows.iter().map(|w| w.len()).sum(),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background sweeper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let limiter = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        limiter.windows.retain(|_, window| {
                            window.retain(|t| now.duration_since(*t) <= limiter.window);
                            !window.is_empty()
                        });
                    }
                    _ = shutdown.changed() => {
                        debug!("message limiter sweeper stopped");
                        return;
                    }
                }
            }
        }));
    }

    /// Stop the sweeper and wait for it to exit.
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

    #[tokio::test]
    async fn global_cap_is_exact() {
        let limiter = ConnectionLimiter::new(3, 10);
        for i in 0..3 {
            limiter
                .check_connection(&PeerId::new(format!("peer-{}", i)))
                .unwrap();
        }
        assert!(limiter.check_connection(&PeerId::new("peer-3")).is_err());

        // Releasing any connection reopens exactly one slot.
        limiter.remove_connection(&PeerId::new("peer-0"));
        limiter.check_connection(&PeerId::new("peer-3")).unwrap();
    }

    #[tokio::test]
    async fn per_source_cap_is_exact() {
        let limiter = ConnectionLimiter::new(100, 2);
        let source = PeerId::new("chatty");
        limiter.check_connection(&source).unwrap();
        limiter.check_connection(&source).unwrap();
        assert!(limiter.check_connection(&source).is_err());

        // A different source is unaffected.
        limiter.check_connection(&PeerId::new("quiet")).unwrap();
    }

    #[tokio::test]
    async fn remove_unknown_source_is_noop() {
        let limiter = ConnectionLimiter::new(10, 10);
        limiter.remove_connection(&PeerId::new("never-seen"));
        assert_eq!(limiter.stats().active_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn message_window_slides() {
        let limiter = MessageLimiter::new(2, Duration::from_secs(10));
        let peer = PeerId::new("peer-1");

        limiter.check_message(&peer).unwrap();
        limiter.check_message(&peer).unwrap();
        assert!(limiter.check_message(&peer).is_err());

        // Once the window has slid past the first two, capacity returns.
        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.check_message(&peer).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_prunes_idle_windows() {
        let limiter = MessageLimiter::new(10, Duration::from_secs(1));
        limiter.start();
        limiter.check_message(&PeerId::new("peer-1")).unwrap();
        assert_eq!(limiter.stats().tracked_entries, 1);

        tokio::time::advance(LIMITER_SWEEP_INTERVAL + Duration::from_secs(2)).await;
        // Let the sweeper tick run.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(limiter.stats().tracked_entries, 0);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_sweeper() {
        let limiter = ConnectionLimiter::new(10, 10);
        limiter.start();
        limiter.stop().await;
        // Second stop is harmless.
        limiter.stop().await;
    }
}
