//! Signed checkpoints of ledger state.
//!
//! A checkpoint commits to the Merkle root of every stored event ID and to a
//! digest of the ledger statistics at the moment it was taken. Checkpoints are
//! the trust anchors for Merkle proofs and the resume point for sync.

use crate::clock::Hlc;
use crate::crypto::{self, AgentId, AgentKeypair, Signature};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};

/// A validator's signature over `event_root || state_root`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub validator: AgentId,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Zero-based position in the checkpoint list.
    pub height: u32,
    pub event_root: Hash,
    pub state_root: Hash,
    /// Clock reading when the checkpoint was taken.
    pub timestamp: Hlc,
    /// Number of events covered by `event_root`.
    pub event_count: u64,
    pub validator_signatures: Vec<ValidatorSignature>,
}

impl Checkpoint {
    /// Build a checkpoint signed by the local agent.
    pub fn new(
        height: u32,
        event_root: Hash,
        state_root: Hash,
        timestamp: Hlc,
        event_count: u64,
        keypair: &AgentKeypair,
    ) -> Self {
        let message = Self::signing_message(&event_root, &state_root);
        let signature = crypto::sign_bytes(&message, keypair);
        Checkpoint {
            height,
            event_root,
            state_root,
            timestamp,
            event_count,
            validator_signatures: vec![ValidatorSignature {
                validator: keypair.agent_id(),
                signature,
            }],
        }
    }

    fn signing_message(event_root: &Hash, state_root: &Hash) -> Vec<u8> {
        let mut message = Vec::with_capacity(64);
        message.extend_from_slice(event_root.as_bytes());
        message.extend_from_slice(state_root.as_bytes());
        message
    }

    /// Add a co-signature from another validator.
    pub fn cosign(&mut self, keypair: &AgentKeypair) {
        let validator = keypair.agent_id();
        if self
            .validator_signatures
            .iter()
            .any(|s| s.validator == validator)
        {
            return;
        }
        let message = Self::signing_message(&self.event_root, &self.state_root);
        self.validator_signatures.push(ValidatorSignature {
            validator,
            signature: crypto::sign_bytes(&message, keypair),
        });
    }

    /// True if there is at least one signature and every one verifies.
    pub fn verify_signatures(&self) -> bool {
        let message = Self::signing_message(&self.event_root, &self.state_root);
        !self.validator_signatures.is_empty()
            && self
                .validator_signatures
                .iter()
                .all(|s| crypto::verify_bytes(&message, &s.signature, &s.validator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hasher;

    #[test]
    fn test_checkpoint_signature_roundtrip() {
        let keypair = AgentKeypair::from_secret([4u8; 32]);
        let mut checkpoint = Checkpoint::new(
            0,
            Hasher::hash(b"events"),
            Hasher::hash(b"state"),
            Hlc::new(1, 0),
            3,
            &keypair,
        );
        assert!(checkpoint.verify_signatures());

        checkpoint.cosign(&AgentKeypair::from_secret([5u8; 32]));
        checkpoint.cosign(&keypair);
        assert_eq!(checkpoint.validator_signatures.len(), 2);
        assert!(checkpoint.verify_signatures());
    }

    #[test]
    fn test_modified_root_breaks_signature() {
        let keypair = AgentKeypair::from_secret([4u8; 32]);
        let mut checkpoint = Checkpoint::new(
            0,
            Hasher::hash(b"events"),
            Hasher::hash(b"state"),
            Hlc::new(1, 0),
            3,
            &keypair,
        );
        checkpoint.event_root = Hasher::hash(b"other");
        assert!(!checkpoint.verify_signatures());
    }
}
