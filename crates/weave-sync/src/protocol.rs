//! Sync wire types and the responder side of the exchange.

use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weave_ledger::{AgentId, Checkpoint, EventId, Hash, Ledger, LedgerEvent};

/// Request for events the requester does not have.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub requester: AgentId,
    pub last_checkpoint_height: Option<u32>,
    pub last_event_root: Option<Hash>,
    /// Maximum number of events to return.
    pub max_events: usize,
    /// Requester's tips plus IDs the responder is already known to hold.
    /// Everything reachable from these is skipped; unknown IDs are ignored.
    pub have: Vec<EventId>,
}

impl SyncRequest {
    /// Describe what `ledger` already holds.
    pub fn from_ledger(ledger: &Ledger, max_events: usize) -> Self {
        let checkpoint = ledger.latest_checkpoint();
        SyncRequest {
            requester: ledger.agent_id(),
            last_checkpoint_height: checkpoint.map(|c| c.height),
            last_event_root: checkpoint.map(|c| c.event_root),
            max_events,
            have: ledger.tips(),
        }
    }

    /// Also advertise `known`.
    pub fn with_known(mut self, known: impl IntoIterator<Item = EventId>) -> Self {
        for id in known {
            if !self.have.contains(&id) {
                self.have.push(id);
            }
        }
        self
    }
}

/// Response to a [`SyncRequest`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Missing events, parents before children.
    pub events: Vec<LedgerEvent>,
    pub checkpoint: Option<Checkpoint>,
    pub has_more: bool,
    /// Responder's tips, used by the requester to decide what to push back.
    pub heads: Vec<EventId>,
}

/// Serve `request` from `ledger`.
pub fn respond_to_sync(ledger: &Ledger, request: &SyncRequest) -> SyncResponse {
    let (events, has_more) = ledger.events_unknown_to(&request.have, request.max_events);
    tracing::debug!(
        requester = %request.requester.short(),
        events = events.len(),
        has_more,
        "serving sync request"
    );
    SyncResponse {
        events,
        checkpoint: ledger.latest_checkpoint().cloned(),
        has_more,
        heads: ledger.tips(),
    }
}

/// Outcome of syncing with one peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub peer_id: PeerId,
    pub success: bool,
    /// Events newly accepted into the local ledger.
    pub events_received: usize,
    /// Received events that failed validation.
    pub events_rejected: usize,
    /// Events the peer accepted from us.
    pub events_sent: usize,
    pub new_checkpoint_height: Option<u32>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn failed(peer_id: PeerId, duration: Duration, error: impl Into<String>) -> Self {
        SyncResult {
            peer_id,
            success: false,
            events_received: 0,
            events_rejected: 0,
            events_sent: 0,
            new_checkpoint_height: None,
            duration,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_ledger::{AgentKeypair, EventPayload, LedgerConfig};

    fn ledger(secret: u8) -> Ledger {
        Ledger::in_memory(LedgerConfig::default(), AgentKeypair::from_secret([secret; 32]))
    }

    #[test]
    fn test_response_skips_known_history() {
        let mut remote = ledger(1);
        let a = remote.append(EventPayload::node_created("a", "t")).unwrap();
        let b = remote.append(EventPayload::node_created("b", "t")).unwrap();

        let mut local = ledger(2);
        local.validate_and_insert(a.clone()).unwrap();

        let request = SyncRequest::from_ledger(&local, 100);
        assert_eq!(request.have, vec![a.id]);
        assert_eq!(request.last_checkpoint_height, None);

        let response = respond_to_sync(&remote, &request);
        assert_eq!(response.events, vec![b.clone()]);
        assert_eq!(response.heads, vec![b.id]);
        assert!(!response.has_more);
    }

    #[test]
    fn test_known_ids_skip_history_behind_unshared_tips() {
        let mut remote = ledger(1);
        let a = remote.append(EventPayload::node_created("a", "t")).unwrap();
        let b = remote.append(EventPayload::node_created("b", "t")).unwrap();

        let mut local = ledger(2);
        local.validate_and_insert(a.clone()).unwrap();
        local.validate_and_insert(b.clone()).unwrap();
        // A local event the remote has never seen hides `b` behind it.
        local.append(EventPayload::node_created("mine", "t")).unwrap();

        let blind = SyncRequest::from_ledger(&local, 100);
        assert_eq!(respond_to_sync(&remote, &blind).events.len(), 2);

        let request = SyncRequest::from_ledger(&local, 100).with_known([b.id, b.id]);
        assert_eq!(request.have.iter().filter(|id| **id == b.id).count(), 1);
        assert!(respond_to_sync(&remote, &request).events.is_empty());
    }

    #[test]
    fn test_response_is_capped() {
        let mut remote = ledger(1);
        for n in 0..5 {
            remote
                .append(EventPayload::node_created(format!("n{n}"), "t"))
                .unwrap();
        }
        remote.create_checkpoint().unwrap();

        let request = SyncRequest::from_ledger(&ledger(2), 2);
        let response = respond_to_sync(&remote, &request);
        assert_eq!(response.events.len(), 2);
        assert!(response.has_more);
        assert_eq!(response.checkpoint.map(|c| c.height), Some(0));
        // Roots first: the first event has no parents.
        assert!(response.events[0].parents().is_empty());
    }
}
