//! Error types for syndication.

use crate::peer::PeerId;
use std::time::Duration;
use thiserror::Error;
use weave_ledger::LedgerError;

/// Failure reported by a [`crate::Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Disconnected")]
    Disconnected,
}

/// Error type for syndication operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
}

/// Result type for syndication operations.
pub type Result<T> = std::result::Result<T, SyncError>;
