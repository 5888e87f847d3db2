//! Metadata models for objects and segments
//!
//! These structs map directly to the `objects` and `segments` tables.

use crate::error::{MetabaseError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tessera_core::{
    ContentHash, NodeId, PieceNumber, RedundancyScheme, SegmentId, StreamId,
};
use uuid::Uuid;

/// Object status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// Upload in progress (multipart upload not yet finalized)
    Pending,
    /// Upload finalized
    Committed,
}

impl ObjectStatus {
    /// Column encoding
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::Pending => 1,
            Self::Committed => 2,
        }
    }

    /// Parse the column encoding
    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Self::Pending),
            2 => Ok(Self::Committed),
            other => Err(MetabaseError::Invalid(format!("unknown object status {}", other))),
        }
    }
}

impl std::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Committed => write!(f, "committed"),
        }
    }
}

/// Full object key tuple; the derived ordering is the keyset scan order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectKey {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Vec<u8>,
    pub version: i64,
}

impl ObjectKey {
    pub fn new(
        project_id: Uuid,
        bucket_name: impl Into<String>,
        object_key: impl Into<Vec<u8>>,
        version: i64,
    ) -> Self {
        Self {
            project_id,
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
            version,
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.project_id,
            self.bucket_name,
            String::from_utf8_lossy(&self.object_key),
            self.version
        )
    }
}

/// An object's key plus the stream that owns its segments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectStream {
    pub key: ObjectKey,
    pub stream_id: StreamId,
}

/// Object metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub key: ObjectKey,
    pub stream_id: StreamId,
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Only set while the object is pending
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl Object {
    /// A committed object
    pub fn committed(key: ObjectKey, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            stream_id: StreamId::new(),
            status: ObjectStatus::Committed,
            created_at: Utc::now(),
            expires_at,
            zombie_deletion_deadline: None,
        }
    }

    /// A pending (in-progress multipart) object
    pub fn pending(key: ObjectKey, zombie_deletion_deadline: DateTime<Utc>) -> Self {
        Self {
            key,
            stream_id: StreamId::new(),
            status: ObjectStatus::Pending,
            created_at: Utc::now(),
            expires_at: None,
            zombie_deletion_deadline: Some(zombie_deletion_deadline),
        }
    }

    pub fn object_stream(&self) -> ObjectStream {
        ObjectStream {
            key: self.key.clone(),
            stream_id: self.stream_id,
        }
    }
}

/// One piece of a segment held by one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Piece {
    pub number: PieceNumber,
    pub node_id: NodeId,
}

impl Piece {
    pub fn new(number: PieceNumber, node_id: NodeId) -> Self {
        Self { number, node_id }
    }
}

/// Sort pieces into their canonical order (piece number, then node)
pub fn normalize_pieces(pieces: &[Piece]) -> Vec<Piece> {
    let mut sorted = pieces.to_vec();
    sorted.sort();
    sorted
}

/// Whether two piece lists hold the same set of pieces
pub fn same_pieces(a: &[Piece], b: &[Piece]) -> bool {
    a.len() == b.len() && normalize_pieces(a) == normalize_pieces(b)
}

/// Encode a piece list into its column form (canonical order)
pub fn encode_pieces(pieces: &[Piece]) -> Result<Vec<u8>> {
    bincode::serialize(&normalize_pieces(pieces)).map_err(MetabaseError::from)
}

/// Decode a piece list from its column form
pub fn decode_pieces(bytes: &[u8]) -> Result<Vec<Piece>> {
    bincode::deserialize(bytes).map_err(MetabaseError::from)
}

/// Segment metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    pub redundancy: RedundancyScheme,
    pub pieces: Vec<Piece>,
    /// Size of the encrypted payload in bytes
    pub encrypted_size: u32,
    /// Hash of every piece number the scheme can produce
    pub piece_hashes: Vec<ContentHash>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Segment {
    /// Size of each piece
    pub fn piece_size(&self) -> usize {
        self.redundancy.piece_size(self.encrypted_size as usize).max(1)
    }

    /// Expected hash for a piece number
    pub fn piece_hash(&self, number: PieceNumber) -> Option<&ContentHash> {
        self.piece_hashes.get(usize::from(number))
    }

    /// Distinct nodes holding pieces
    pub fn node_ids(&self) -> HashSet<NodeId> {
        self.pieces.iter().map(|p| p.node_id).collect()
    }

    /// Whether the segment has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Check the piece list invariants against this segment's scheme
    pub fn validate_pieces(&self, pieces: &[Piece]) -> Result<()> {
        if pieces.len() > usize::from(self.redundancy.total) {
            return Err(MetabaseError::Invalid(format!(
                "segment {}: {} pieces exceed total {}",
                self.id,
                pieces.len(),
                self.redundancy.total
            )));
        }

        let mut nodes = HashSet::with_capacity(pieces.len());
        let mut numbers = HashSet::with_capacity(pieces.len());
        for piece in pieces {
            if piece.number >= self.redundancy.total {
                return Err(MetabaseError::Invalid(format!(
                    "segment {}: piece number {} out of range",
                    self.id, piece.number
                )));
            }
            if !nodes.insert(piece.node_id) {
                return Err(MetabaseError::Invalid(format!(
                    "segment {}: node {} holds more than one piece",
                    self.id, piece.node_id
                )));
            }
            if !numbers.insert(piece.number) {
                return Err(MetabaseError::Invalid(format!(
                    "segment {}: piece number {} is duplicated",
                    self.id, piece.number
                )));
            }
        }
        Ok(())
    }
}

/// Rows removed by one object deletion unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedCounts {
    pub objects: u64,
    pub segments: u64,
}

impl std::ops::AddAssign for DeletedCounts {
    fn add_assign(&mut self, other: Self) {
        self.objects += other.objects;
        self.segments += other.segments;
    }
}
