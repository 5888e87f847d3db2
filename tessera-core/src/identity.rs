//! Cryptographic primitives for Tessera
//!
//! Provides:
//! - Blake3 content hashing for piece verification
//! - ed25519 signing identities for order limits

use crate::error::{CoreError, Result};
use crate::ids::NodeId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// ed25519 secret key size (32 bytes)
pub const SECRET_KEY_SIZE: usize = 32;

/// ed25519 signature size (64 bytes)
pub const SIGNATURE_SIZE: usize = 64;

/// Blake3 hash wrapper for piece contents
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Signing identity of a satellite or node
#[derive(Clone)]
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Load from a 32-byte secret (validates length)
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_KEY_SIZE] = secret.try_into().map_err(|_| {
            CoreError::InvalidIdentity(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_SIZE,
                secret.len()
            ))
        })?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Load from a hex-encoded secret
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Node id derived from the public key
    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.key.verifying_key().to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.key.sign(message).to_bytes()
    }

    /// Sign and verify a fixed message, proving the key pair is usable
    pub fn self_check(&self) -> Result<()> {
        let message = b"tessera-identity-check";
        let signature = self.sign(message);
        verify_signature(&self.node_id(), message, &signature)
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by `signer`
pub fn verify_signature(signer: &NodeId, message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(signer.as_bytes())
        .map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;
    let signature = Signature::from_slice(signature).map_err(|_| CoreError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| CoreError::InvalidSignature)
}
