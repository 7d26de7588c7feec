//! # weave-sync
//!
//! Syndication (peer-to-peer replication) for the Weave event ledger.
//!
//! This crate provides:
//! - A registry of remote peers and their connection/sync state
//! - A pluggable [`Transport`] boundary with an in-memory implementation
//! - The sync exchange: pull missing events, validate them, push ours back
//! - Background retries with exponential backoff and jitter
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use weave_ledger::{AgentKeypair, EventPayload, Ledger, LedgerConfig, SharedLedger};
//! use weave_sync::{MemoryNetwork, SyndicationConfigBuilder, SyndicationService};
//!
//! # tokio_test::block_on(async {
//! let network = MemoryNetwork::new();
//! let remote = SharedLedger::new(Ledger::in_memory(LedgerConfig::default(), AgentKeypair::generate()));
//! remote.append_event(EventPayload::node_created("alice", "person")).unwrap();
//! network.register("mem://remote", remote);
//!
//! let local = SharedLedger::new(Ledger::in_memory(LedgerConfig::default(), AgentKeypair::generate()));
//! let config = SyndicationConfigBuilder::new().peer("mem://remote").auto_sync(false).build();
//! let service = SyndicationService::new(config, local, Arc::new(network.transport()));
//!
//! service.start().await;
//! let results = service.sync_with_all_peers().await;
//! assert!(results[0].success);
//! assert_eq!(results[0].events_received, 1);
//! service.stop().await;
//! # });
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod service;
pub mod transport;

pub use backoff::{compute_backoff, RetryPolicy};
pub use config::{SyndicationConfig, SyndicationConfigBuilder};
pub use error::{Result, SyncError, TransportError};
pub use peer::{Peer, PeerId, PeerRegistry, PeerStatus};
pub use protocol::{respond_to_sync, SyncRequest, SyncResponse, SyncResult};
pub use service::{SyndicationService, SyndicationStats};
pub use transport::{Fault, MemoryNetwork, MemoryTransport, Transport};
