//! # Protocol Registry
//!
//! Maps protocol IDs to message handlers and exposes read-only snapshots
//! for diagnostics. Registration is strict: registering an ID that is
//! already present fails rather than silently overwriting — a duplicate
//! registration is a programming error and deserves to be caught at setup
//! time, not discovered in production when half the handlers went missing.
//! Unregistration is idempotent.
//!
//! Protocol IDs are hierarchical path-like strings ending in a semantic
//! version, e.g. `/arc/sync/1.0.0`. During a namespace migration window the
//! facade registers both the namespace-qualified and the original form of
//! every protocol, so peers that have not adopted namespacing keep working.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::NetError;
use crate::substrate::PeerId;
use crate::wire::envelope::unix_millis;

/// Handler invoked for each inbound request on a protocol. Returns the
/// response payload or an application error surfaced to the remote caller.
pub type ProtocolHandler =
    Arc<dyn Fn(PeerId, Bytes) -> BoxFuture<'static, Result<Bytes, NetError>> + Send + Sync>;

/// Qualify a protocol ID with the deployment namespace. Pure and
/// idempotent: an already-qualified ID passes through unchanged, and an
/// empty namespace disables qualification entirely.
///
/// `/arc/sync/1.0.0` + `testnet-7` → `/testnet-7/arc/sync/1.0.0`
pub fn qualify_protocol(id: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => {
            let prefix = format!("/{}/", ns);
            if id.starts_with(&prefix) {
                id.to_string()
            } else {
                format!("/{}{}", ns, id)
            }
        }
        _ => id.to_string(),
    }
}

/// Immutable snapshot describing one registered protocol. Created at
/// registration time and replaced — never mutated — on re-registration.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolInfo {
    pub id: String,
    /// Trailing path segment of the ID, by convention a semver.
    pub version: String,
    pub registered_at_ms: u64,
    pub metadata: HashMap<String, String>,
}

impl ProtocolInfo {
    fn new(id: &str, metadata: HashMap<String, String>) -> Self {
        let version = id.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id: id.to_string(),
            version,
            registered_at_ms: unix_millis(),
            metadata,
        }
    }
}

struct Registration {
    info: ProtocolInfo,
    handler: ProtocolHandler,
}

/// The protocol → handler map. All access goes through methods; the inner
/// map never escapes.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, Registration>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the ID. Fails on duplicates.
    pub fn register(&self, id: &str, handler: ProtocolHandler) -> Result<(), NetError> {
        self.register_with_metadata(id, handler, HashMap::new())
    }

    /// Register with diagnostics metadata attached to the info snapshot.
    pub fn register_with_metadata(
        &self,
        id: &str,
        handler: ProtocolHandler,
        metadata: HashMap<String, String>,
    ) -> Result<(), NetError> {
        let mut protocols = self.protocols.write();
        if protocols.contains_key(id) {
            return Err(NetError::DuplicateRegistration(id.to_string()));
        }
        protocols.insert(
            id.to_string(),
            Registration {
                info: ProtocolInfo::new(id, metadata),
                handler,
            },
        );
        Ok(())
    }

    /// Remove the registration. Idempotent; returns whether anything was
    /// actually removed.
    pub fn unregister(&self, id: &str) -> bool {
        self.protocols.write().remove(id).is_some()
    }

    /// Handler lookup for the inbound dispatch path.
    pub fn get(&self, id: &str) -> Option<ProtocolHandler> {
        self.protocols.read().get(id).map(|r| Arc::clone(&r.handler))
    }

    /// Info snapshot for one protocol.
    pub fn info(&self, id: &str) -> Option<ProtocolInfo> {
        self.protocols.read().get(id).map(|r| r.info.clone())
    }

    /// Snapshot of every registered protocol, sorted by ID.
    pub fn list(&self) -> Vec<ProtocolInfo> {
        let mut infos: Vec<ProtocolInfo> = self
            .protocols
            .read()
            .values()
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.protocols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop_handler() -> ProtocolHandler {
        Arc::new(|_, _| async { Ok(Bytes::new()) }.boxed())
    }

    #[test]
    fn qualification_prefixes_namespace() {
        assert_eq!(
            qualify_protocol("/arc/sync/1.0.0", Some("testnet-7")),
            "/testnet-7/arc/sync/1.0.0"
        );
    }

    #[test]
    fn qualification_is_idempotent() {
        let once = qualify_protocol("/arc/sync/1.0.0", Some("testnet-7"));
        assert_eq!(qualify_protocol(&once, Some("testnet-7")), once);
    }

    #[test]
    fn qualification_without_namespace_is_identity() {
        assert_eq!(qualify_protocol("/arc/sync/1.0.0", None), "/arc/sync/1.0.0");
        assert_eq!(qualify_protocol("/arc/sync/1.0.0", Some("")), "/arc/sync/1.0.0");
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ProtocolRegistry::new();
        registry.register("/arc/sync/1.0.0", noop_handler()).unwrap();

        let second = registry.register("/arc/sync/1.0.0", noop_handler());
        assert!(matches!(second, Err(NetError::DuplicateRegistration(_))));

        // The original registration survives the failed attempt.
        assert!(registry.get("/arc/sync/1.0.0").is_some());
    }

    #[test]
    fn reregistration_after_unregister_succeeds() {
        let registry = ProtocolRegistry::new();
        registry.register("/arc/sync/1.0.0", noop_handler()).unwrap();
        assert!(registry.unregister("/arc/sync/1.0.0"));
        registry.register("/arc/sync/1.0.0", noop_handler()).unwrap();
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ProtocolRegistry::new();
        assert!(!registry.unregister("/arc/never/1.0.0"));
        assert!(!registry.unregister("/arc/never/1.0.0"));
    }

    #[test]
    fn info_extracts_version_segment() {
        let registry = ProtocolRegistry::new();
        registry.register("/arc/sync/2.1.0", noop_handler()).unwrap();
        let info = registry.info("/arc/sync/2.1.0").unwrap();
        assert_eq!(info.version, "2.1.0");
    }

    #[test]
    fn list_is_sorted_snapshot() {
        let registry = ProtocolRegistry::new();
        registry.register("/arc/sync/1.0.0", noop_handler()).unwrap();
        registry.register("/arc/ping/1.0.0", noop_handler()).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["/arc/ping/1.0.0", "/arc/sync/1.0.0"]);
    }
}
