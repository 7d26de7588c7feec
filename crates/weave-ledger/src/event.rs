//! Ledger events.
//!
//! Each event carries:
//! - The DAG tips observed when it was created (its parents)
//! - A hybrid logical timestamp
//! - The author's identity and a signature over the event ID
//! - A typed payload describing the knowledge-graph mutation
//!
//! The event ID is the SHA-256 of the canonical JSON encoding of the envelope,
//! so any change to the envelope changes the ID.

use crate::clock::Hlc;
use crate::crypto::{self, AgentId, AgentKeypair, Signature};
use crate::hash::{EventId, Hash, Hasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Free-form properties attached to nodes and edges.
pub type Properties = BTreeMap<String, Value>;

/// The closed set of things that can be recorded in the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    NodeCreated {
        node_id: String,
        node_type: String,
        #[serde(default)]
        properties: Properties,
    },
    NodeUpdated {
        node_id: String,
        changes: Properties,
    },
    NodeDeleted {
        node_id: String,
    },
    EdgeCreated {
        edge_id: String,
        source: String,
        target: String,
        relation: String,
        #[serde(default)]
        properties: Properties,
    },
    EdgeDeleted {
        edge_id: String,
    },
    WorkflowStarted {
        workflow_id: String,
        name: String,
    },
    WorkflowCompleted {
        workflow_id: String,
        #[serde(default)]
        output: Option<Value>,
    },
    WorkflowFailed {
        workflow_id: String,
        reason: String,
    },
    SyncStarted {
        peer_id: String,
    },
    SyncCompleted {
        peer_id: String,
        events_received: u64,
        events_sent: u64,
    },
    CheckpointCreated {
        height: u32,
        event_root: Hash,
        state_root: Hash,
    },
    Custom {
        kind: String,
        data: Value,
    },
}

/// Discriminant of [`EventPayload`], used for filtering and statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    EdgeCreated,
    EdgeDeleted,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    SyncStarted,
    SyncCompleted,
    CheckpointCreated,
    Custom,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeCreated => "node_created",
            EventKind::NodeUpdated => "node_updated",
            EventKind::NodeDeleted => "node_deleted",
            EventKind::EdgeCreated => "edge_created",
            EventKind::EdgeDeleted => "edge_deleted",
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::SyncStarted => "sync_started",
            EventKind::SyncCompleted => "sync_completed",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::Custom => "custom",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::NodeCreated { .. } => EventKind::NodeCreated,
            EventPayload::NodeUpdated { .. } => EventKind::NodeUpdated,
            EventPayload::NodeDeleted { .. } => EventKind::NodeDeleted,
            EventPayload::EdgeCreated { .. } => EventKind::EdgeCreated,
            EventPayload::EdgeDeleted { .. } => EventKind::EdgeDeleted,
            EventPayload::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            EventPayload::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            EventPayload::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            EventPayload::SyncStarted { .. } => EventKind::SyncStarted,
            EventPayload::SyncCompleted { .. } => EventKind::SyncCompleted,
            EventPayload::CheckpointCreated { .. } => EventKind::CheckpointCreated,
            EventPayload::Custom { .. } => EventKind::Custom,
        }
    }

    /// Create a node without properties.
    pub fn node_created(node_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        EventPayload::NodeCreated {
            node_id: node_id.into(),
            node_type: node_type.into(),
            properties: Properties::new(),
        }
    }

    /// Link two nodes without properties.
    pub fn edge_created(
        edge_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        EventPayload::EdgeCreated {
            edge_id: edge_id.into(),
            source: source.into(),
            target: target.into(),
            relation: relation.into(),
            properties: Properties::new(),
        }
    }
}

/// The signed portion of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub parents: Vec<EventId>,
    pub hlc: Hlc,
    pub author: AgentId,
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Canonical bytes: compact JSON with object keys in sorted order.
    ///
    /// Going through `serde_json::Value` sorts map keys, so the encoding does
    /// not depend on struct field order.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        serde_json::to_vec(&value)
    }

    /// The content hash of the canonical encoding.
    pub fn compute_id(&self) -> serde_json::Result<EventId> {
        Ok(Hasher::hash(&self.canonical_bytes()?))
    }
}

/// An event as stored in the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub envelope: EventEnvelope,
    pub signature: Signature,
}

impl LedgerEvent {
    /// Hash and sign an envelope with the author's key.
    pub fn seal(envelope: EventEnvelope, keypair: &AgentKeypair) -> serde_json::Result<Self> {
        let id = envelope.compute_id()?;
        let signature = crypto::sign(&id, keypair);
        Ok(LedgerEvent {
            id,
            envelope,
            signature,
        })
    }

    pub fn hlc(&self) -> Hlc {
        self.envelope.hlc
    }

    pub fn author(&self) -> &AgentId {
        &self.envelope.author
    }

    pub fn parents(&self) -> &[EventId] {
        &self.envelope.parents
    }

    pub fn kind(&self) -> EventKind {
        self.envelope.payload.kind()
    }

    /// Check that the ID matches the envelope contents.
    pub fn verify_id(&self) -> bool {
        matches!(self.envelope.compute_id(), Ok(id) if id == self.id)
    }

    /// Check the signature over the ID under the claimed author.
    pub fn verify_signature(&self) -> bool {
        crypto::verify(&self.id, &self.signature, &self.envelope.author)
    }
}
