//! Identifiers for nodes, streams, segments and pieces
//!
//! A node is identified by its ed25519 public key. An object owns one
//! stream; a stream is split into segments addressed by `(part, index)`;
//! each segment is erasure coded into numbered pieces.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of an erasure-coded piece within its segment
pub type PieceNumber = u16;

/// Storage node identifier (the node's ed25519 public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| CoreError::InvalidId(format!("node id must be 32 bytes, got {}", slice.len())))?;
        Ok(Self(bytes))
    }

    /// Random node id, used by tests and simulations
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Stream identifier, shared by an object and all of its segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a new random stream id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Whether this is the nil stream id
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a segment inside its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SegmentPosition {
    /// Multipart upload part number
    pub part: u32,
    /// Segment index within the part
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Pack into a single ordered integer (part in the high bits)
    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    /// Unpack from [`SegmentPosition::encode`]
    pub fn decode(value: u64) -> Self {
        Self {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }
}

/// Segment identity: the owning stream plus the segment position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
}

impl SegmentId {
    pub fn new(stream_id: StreamId, position: SegmentPosition) -> Self {
        Self {
            stream_id,
            position,
        }
    }

    /// Identifier a storage node files the given piece under
    pub fn piece_id(&self, number: PieceNumber) -> PieceId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.stream_id.as_uuid().as_bytes());
        hasher.update(&self.position.encode().to_be_bytes());
        hasher.update(&number.to_be_bytes());
        PieceId(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.stream_id, self.position.part, self.position.index
        )
    }
}

/// Piece identifier as stored on a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PieceId([u8; 32]);

impl PieceId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
