//! # weave-ledger
//!
//! Tamper-evident event ledger for the Weave knowledge graph.
//!
//! This crate provides:
//! - Content-addressed, signed events linked into a causal DAG
//! - Hybrid logical clock timestamps for a total order across agents
//! - Periodic signed checkpoints committing to a Merkle root of all events
//! - Merkle inclusion proofs verified against the latest checkpoint
//! - Durable JSON-lines storage with crash-tolerant reload
//!
//! ## Example
//!
//! ```rust
//! use weave_ledger::{AgentKeypair, EventPayload, Ledger, LedgerConfig};
//!
//! let mut ledger = Ledger::in_memory(LedgerConfig::default(), AgentKeypair::generate());
//!
//! let first = ledger.append(EventPayload::node_created("alice", "person")).unwrap();
//! let second = ledger.append(EventPayload::node_created("bob", "person")).unwrap();
//!
//! // Each local event builds on the previous tips.
//! assert_eq!(second.parents(), &[first.id]);
//! assert_eq!(ledger.tips(), vec![second.id]);
//! ```

mod checkpoint;
mod clock;
mod config;
mod crypto;
mod error;
mod event;
mod hash;
mod ledger;
mod merkle;
mod storage;

pub use checkpoint::{Checkpoint, ValidatorSignature};
pub use clock::{HybridClock, Hlc, ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{ConfigValidation, LedgerConfig, LedgerConfigBuilder};
pub use crypto::{sign, verify, AgentId, AgentKeypair, Signature};
pub use error::{LedgerError, Result, ValidationError};
pub use event::{EventEnvelope, EventKind, EventPayload, LedgerEvent, Properties};
pub use hash::{EventId, Hash, Hasher};
pub use ledger::{
    causal_order, ChainStats, EventQueryOptions, EventQueryResult, EventValidation, ImportResult,
    Ledger, LedgerExport, SharedLedger,
};
pub use merkle::{Direction, MerkleProof, MerkleTree};
pub use storage::{FileStore, LedgerStore, MemoryStore, StoredState};
