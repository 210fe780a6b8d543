//! # Inbound Backpressure Gate
//!
//! Bounds concurrent handler invocations per protocol with a counting
//! semaphore. Overload produces rejection — the caller resets the stream —
//! rather than an unbounded queue of pending handlers eating the heap.
//!
//! One semaphore per protocol, created lazily on first use and removed when
//! the protocol is unregistered. Permits are RAII: dropping the permit on
//! any exit path, panic included, releases the slot.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::NetError;

/// Per-protocol counting semaphore map.
pub struct InflightGate {
    semaphores: DashMap<String, Arc<Semaphore>>,
    capacity: usize,
}

impl InflightGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphores: DashMap::new(),
            capacity,
        }
    }

    /// Acquire a handler slot for `protocol`, waiting up to `deadline`.
    ///
    /// A timeout means the protocol is saturated; the stream that wanted
    /// the slot should be reset, not queued.
    pub async fn acquire(
        &self,
        protocol: &str,
        deadline: Duration,
    ) -> Result<OwnedSemaphorePermit, NetError> {
        let semaphore = self
            .semaphores
            .entry(protocol.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone();

        match tokio::time::timeout(deadline, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(NetError::Shutdown),
            Err(_) => Err(NetError::RateLimited(format!(
                "protocol {} at inflight capacity {}",
                protocol, self.capacity
            ))),
        }
    }

    /// Non-blocking acquire, for callers that would rather fail than wait.
    pub fn try_acquire(&self, protocol: &str) -> Result<OwnedSemaphorePermit, NetError> {
        let semaphore = self
            .semaphores
            .entry(protocol.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone();

        semaphore.try_acquire_owned().map_err(|_| {
            NetError::RateLimited(format!(
                "protocol {} at inflight capacity {}",
                protocol, self.capacity
            ))
        })
    }

    /// Drop the protocol's semaphore. Outstanding permits stay valid; new
    /// acquires after a re-registration start from a fresh semaphore.
    pub fn remove(&self, protocol: &str) {
        self.semaphores.remove(protocol);
    }

    /// Slots currently available for the protocol, or the full capacity if
    /// it has never been used.
    pub fn available(&self, protocol: &str) -> usize {
        self.semaphores
            .get(protocol)
            .map(|s| s.available_permits())
            .unwrap_or(self.capacity)
    }
}
