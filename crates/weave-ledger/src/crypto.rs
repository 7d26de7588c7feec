//! Ed25519 identities and signatures.
//!
//! An agent is identified by its verifying key, so a signature can be checked
//! from the event alone without any key directory.

use crate::error::{LedgerError, Result};
use crate::hash::{hex_decode, hex_encode, Hash};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

/// Identity of an event author: the 32-byte Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId([u8; 32]);

impl AgentId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AgentId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 32] = hex_decode(s)?.try_into().ok()?;
        Some(AgentId(bytes))
    }

    /// Truncated display (first 8 chars).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({}...)", self.short())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AgentId::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid agent id: {s}")))
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 64] = hex_decode(s)?.try_into().ok()?;
        Some(Signature(bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid signature encoding"))
    }
}

/// The local agent's signing key.
pub struct AgentKeypair {
    signing: SigningKey,
}

impl AgentKeypair {
    /// Generate a fresh keypair from the OS-seeded thread RNG.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        AgentKeypair {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId(self.signing.verifying_key().to_bytes())
    }

    /// Load the key stored at `path`, or generate one and write it there.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let secret: [u8; 32] = hex_decode(contents.trim())
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| LedgerError::InvalidKey(path.display().to_string()))?;
            return Ok(Self::from_secret(secret));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex_encode(&keypair.signing.to_bytes()))?;
        tracing::info!(agent = %keypair.agent_id().short(), path = %path.display(), "generated agent key");
        Ok(keypair)
    }
}

impl fmt::Debug for AgentKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentKeypair")
            .field("agent_id", &self.agent_id())
            .finish_non_exhaustive()
    }
}

/// Sign a digest with the agent's private key.
pub fn sign(digest: &Hash, keypair: &AgentKeypair) -> Signature {
    sign_bytes(digest.as_bytes(), keypair)
}

/// Verify a digest signature under the author's public key.
pub fn verify(digest: &Hash, signature: &Signature, author: &AgentId) -> bool {
    verify_bytes(digest.as_bytes(), signature, author)
}

pub(crate) fn sign_bytes(message: &[u8], keypair: &AgentKeypair) -> Signature {
    Signature(keypair.signing.sign(message).to_bytes())
}

pub(crate) fn verify_bytes(message: &[u8], signature: &Signature, author: &AgentId) -> bool {
    let Some(key) = author.verifying_key() else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify(message, &signature).is_ok()
}

/// Whether the author bytes decode to a usable Ed25519 point.
pub(crate) fn is_valid_agent(author: &AgentId) -> bool {
    author.verifying_key().is_some()
}
