//! Transport abstraction and an in-memory implementation.

use crate::error::TransportError;
use crate::peer::Peer;
use crate::protocol::{respond_to_sync, SyncRequest, SyncResponse};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use weave_ledger::{causal_order, EventPayload, LedgerEvent, SharedLedger};

/// Moves sync traffic between the local agent and a remote peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish (or confirm) a connection to the peer.
    async fn handshake(&self, peer: &Peer) -> Result<(), TransportError>;

    /// Ask the peer for events the requester is missing.
    async fn fetch_from_peer(
        &self,
        peer: &Peer,
        request: SyncRequest,
    ) -> Result<SyncResponse, TransportError>;

    /// Offer events to the peer. Returns how many it accepted.
    async fn send_to_peer(
        &self,
        peer: &Peer,
        events: Vec<LedgerEvent>,
    ) -> Result<usize, TransportError>;

    /// Tear down the connection.
    async fn disconnect(&self, peer: &Peer) -> Result<(), TransportError>;
}

/// Failure injected into a [`MemoryNetwork`] node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails to connect.
    Unreachable,
    /// Handshakes succeed but fetches fail.
    FailFetch,
    /// Handshakes and fetches succeed but sends fail.
    FailSend,
    /// Every call is delayed before being served.
    Latency(Duration),
    /// Served events have their payload altered after sealing.
    CorruptEvents,
}

#[derive(Clone)]
struct Node {
    ledger: SharedLedger,
    fault: Option<Fault>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Node>,
    fetches: HashMap<String, usize>,
    served: HashMap<String, usize>,
}

/// In-process network of ledgers addressed by endpoint string.
///
/// Requests are served directly from the target node's ledger, so several
/// syndication services can be wired together inside one process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `ledger` at `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, ledger: SharedLedger) {
        self.state
            .write()
            .nodes
            .insert(endpoint.into(), Node { ledger, fault: None });
    }

    pub fn unregister(&self, endpoint: &str) {
        self.state.write().nodes.remove(endpoint);
    }

    pub fn set_fault(&self, endpoint: &str, fault: Fault) {
        if let Some(node) = self.state.write().nodes.get_mut(endpoint) {
            node.fault = Some(fault);
        }
    }

    pub fn clear_fault(&self, endpoint: &str) {
        if let Some(node) = self.state.write().nodes.get_mut(endpoint) {
            node.fault = None;
        }
    }

    /// Number of fetches attempted against `endpoint`, failed ones included.
    pub fn fetch_count(&self, endpoint: &str) -> usize {
        self.state.read().fetches.get(endpoint).copied().unwrap_or(0)
    }

    /// Number of events `endpoint` has handed out in fetch responses.
    pub fn served_count(&self, endpoint: &str) -> usize {
        self.state.read().served.get(endpoint).copied().unwrap_or(0)
    }

    /// A transport handle onto this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    fn node(&self, endpoint: &str) -> Result<Node, TransportError> {
        self.state
            .read()
            .nodes
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no node at {endpoint}")))
    }

    fn count_fetch(&self, endpoint: &str) {
        *self
            .state
            .write()
            .fetches
            .entry(endpoint.to_string())
            .or_insert(0) += 1;
    }

    fn count_served(&self, endpoint: &str, events: usize) {
        *self
            .state
            .write()
            .served
            .entry(endpoint.to_string())
            .or_insert(0) += events;
    }
}

/// [`Transport`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Resolve the node for `peer`, applying connection-level faults.
    async fn reach(&self, peer: &Peer) -> Result<Node, TransportError> {
        let node = self.network.node(&peer.endpoint)?;
        match &node.fault {
            Some(Fault::Unreachable) => Err(TransportError::ConnectionFailed(format!(
                "{} is unreachable",
                peer.endpoint
            ))),
            Some(Fault::Latency(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(node)
            }
            _ => Ok(node),
        }
    }
}

fn corrupt(mut event: LedgerEvent) -> LedgerEvent {
    event.envelope.payload = EventPayload::Custom {
        kind: "corrupted".to_string(),
        data: serde_json::Value::Null,
    };
    event
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn handshake(&self, peer: &Peer) -> Result<(), TransportError> {
        self.reach(peer).await.map(|_| ())
    }

    async fn fetch_from_peer(
        &self,
        peer: &Peer,
        request: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        self.network.count_fetch(&peer.endpoint);
        let node = self.reach(peer).await?;
        if node.fault == Some(Fault::FailFetch) {
            return Err(TransportError::RequestFailed(format!(
                "fetch from {} failed",
                peer.endpoint
            )));
        }

        let mut response = respond_to_sync(&node.ledger.read(), &request);
        self.network.count_served(&peer.endpoint, response.events.len());
        if node.fault == Some(Fault::CorruptEvents) {
            response.events = response.events.into_iter().map(corrupt).collect();
        }
        Ok(response)
    }

    async fn send_to_peer(
        &self,
        peer: &Peer,
        events: Vec<LedgerEvent>,
    ) -> Result<usize, TransportError> {
        let node = self.reach(peer).await?;
        if node.fault == Some(Fault::FailSend) {
            return Err(TransportError::RequestFailed(format!(
                "send to {} failed",
                peer.endpoint
            )));
        }

        let mut accepted = 0;
        for event in causal_order(events) {
            let validation = node
                .ledger
                .validate_and_insert(event)
                .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
            if validation.is_new() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn disconnect(&self, peer: &Peer) -> Result<(), TransportError> {
        self.network.node(&peer.endpoint).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ledger::{AgentKeypair, Ledger, LedgerConfig};

    fn shared(secret: u8) -> SharedLedger {
        SharedLedger::new(Ledger::in_memory(
            LedgerConfig::default(),
            AgentKeypair::from_secret([secret; 32]),
        ))
    }

    #[tokio::test]
    async fn test_unknown_endpoint_fails_handshake() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let result = transport.handshake(&Peer::new("mem://nowhere")).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_fetch_and_send() {
        let network = MemoryNetwork::new();
        let remote = shared(1);
        remote
            .append_event(EventPayload::node_created("a", "t"))
            .unwrap();
        network.register("mem://remote", remote.clone());

        let local = shared(2);
        let peer = Peer::new("mem://remote");
        let transport = network.transport();

        transport.handshake(&peer).await.unwrap();
        let request = SyncRequest::from_ledger(&local.read(), 100);
        let response = transport.fetch_from_peer(&peer, request).await.unwrap();
        assert_eq!(response.events.len(), 1);
        assert_eq!(network.fetch_count("mem://remote"), 1);

        let mine = local
            .append_event(EventPayload::node_created("b", "t"))
            .unwrap();
        let accepted = transport.send_to_peer(&peer, vec![mine.clone()]).await.unwrap();
        assert_eq!(accepted, 1);
        assert!(remote.read().contains(&mine.id));

        // Already present on the remote.
        let accepted = transport.send_to_peer(&peer, vec![mine]).await.unwrap();
        assert_eq!(accepted, 0);
    }

    #[tokio::test]
    async fn test_faults() {
        let network = MemoryNetwork::new();
        network.register("mem://remote", shared(1));
        let peer = Peer::new("mem://remote");
        let transport = network.transport();

        network.set_fault("mem://remote", Fault::Unreachable);
        assert!(transport.handshake(&peer).await.is_err());

        network.set_fault("mem://remote", Fault::FailFetch);
        transport.handshake(&peer).await.unwrap();
        let request = SyncRequest::from_ledger(&shared(2).read(), 10);
        assert!(matches!(
            transport.fetch_from_peer(&peer, request).await,
            Err(TransportError::RequestFailed(_))
        ));

        network.clear_fault("mem://remote");
        assert!(transport.send_to_peer(&peer, Vec::new()).await.is_ok());
    }
}
