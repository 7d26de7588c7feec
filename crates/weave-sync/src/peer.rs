//! Peer identities and the peer registry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use weave_ledger::EventId;

/// Local identifier for a remote peer.
///
/// Derived from the endpoint with FNV-1a, so the same endpoint always maps to
/// the same ID. It is not a security boundary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_endpoint(endpoint: &str) -> Self {
        Self(format!("peer-{:08x}", fnv1a(endpoint.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(PRIME))
}

/// Connection state of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Disconnected,
    Connected,
    Syncing,
    Error,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Connected => "connected",
            PeerStatus::Syncing => "syncing",
            PeerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything the local agent knows about one remote peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub endpoint: String,
    pub status: PeerStatus,
    pub events_received: u64,
    pub events_sent: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_sync_time: Option<SystemTime>,
    pub last_checkpoint_height: Option<u32>,
    /// Round-trip time of the last successful handshake.
    pub latency: Option<Duration>,
    /// Consecutive failed syncs since the last success.
    pub retry_attempts: u32,
    /// Tips the peer reported in its last sync response.
    pub known_heads: Vec<EventId>,
}

impl Peer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Peer {
            id: PeerId::from_endpoint(&endpoint),
            endpoint,
            status: PeerStatus::Disconnected,
            events_received: 0,
            events_sent: 0,
            errors: 0,
            last_error: None,
            last_sync_time: None,
            last_checkpoint_height: None,
            latency: None,
            retry_attempts: 0,
            known_heads: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == PeerStatus::Connected
    }

    /// Move to `Error`, bumping the error counter.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.status = PeerStatus::Error;
        self.errors += 1;
        self.last_error = Some(error.into());
    }
}

/// Thread-safe map of known peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint`. Returns its ID and whether it was newly added.
    pub fn add(&self, endpoint: &str) -> (PeerId, bool) {
        let peer = Peer::new(endpoint);
        let id = peer.id.clone();
        let mut peers = self.peers.write();
        if peers.contains_key(&id) {
            return (id, false);
        }
        peers.insert(id.clone(), peer);
        (id, true)
    }

    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// All peers, ordered by ID.
    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn with_status(&self, status: PeerStatus) -> Vec<Peer> {
        self.all().into_iter().filter(|p| p.status == status).collect()
    }

    /// Apply `f` to a peer in place. Returns `None` if the peer is unknown.
    pub fn update<R>(&self, id: &PeerId, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.peers.write().get_mut(id).map(f)
    }

    /// Apply `f` to every peer.
    pub fn update_all(&self, mut f: impl FnMut(&mut Peer)) {
        for peer in self.peers.write().values_mut() {
            f(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_deterministic() {
        let a = PeerId::from_endpoint("http://10.0.0.1:8080");
        let b = PeerId::from_endpoint("http://10.0.0.1:8080");
        let c = PeerId::from_endpoint("http://10.0.0.2:8080");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("peer-"));
        assert_eq!(a.as_str().len(), "peer-".len() + 8);
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_registry_add_is_idempotent() {
        let registry = PeerRegistry::new();
        let (id, added) = registry.add("mem://a");
        assert!(added);
        let (again, added) = registry.add("mem://a");
        assert!(!added);
        assert_eq!(id, again);
        assert_eq!(registry.len(), 1);

        let peer = registry.get(&id).unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(peer.endpoint, "mem://a");
    }

    #[test]
    fn test_registry_update_and_filter() {
        let registry = PeerRegistry::new();
        let (a, _) = registry.add("mem://a");
        let (b, _) = registry.add("mem://b");

        registry.update(&a, |p| p.status = PeerStatus::Connected);
        registry.update(&b, |p| p.record_failure("refused"));

        assert_eq!(registry.with_status(PeerStatus::Connected).len(), 1);
        let failed = registry.with_status(PeerStatus::Error);
        assert_eq!(failed[0].id, b);
        assert_eq!(failed[0].errors, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("refused"));

        assert!(registry.remove(&a).is_some());
        assert!(registry.update(&a, |p| p.errors += 1).is_none());
    }
}
