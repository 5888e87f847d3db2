//! Metabase store abstraction
//!
//! Both the repair pipeline and the garbage collector talk to metadata
//! through [`MetabaseStore`], so tests can run against the in-memory
//! implementation while production uses PostgreSQL or CockroachDB.

use crate::error::Result;
use crate::models::{DeletedCounts, Object, ObjectKey, ObjectStatus, ObjectStream, Piece, Segment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_core::{SegmentId, StreamId};

/// Which objects a collection scan selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Committed objects whose expiration is strictly before the instant
    ExpiredBefore(DateTime<Utc>),
    /// Pending objects whose zombie deadline is strictly before the instant
    ZombieBefore(DateTime<Utc>),
}

impl ScanFilter {
    /// Whether an object matches this filter
    pub fn matches(&self, object: &Object) -> bool {
        match self {
            Self::ExpiredBefore(at) => {
                object.status == ObjectStatus::Committed
                    && object.expires_at.is_some_and(|exp| exp < *at)
            }
            Self::ZombieBefore(at) => {
                object.status == ObjectStatus::Pending
                    && object.zombie_deletion_deadline.is_some_and(|d| d < *at)
            }
        }
    }
}

/// One page request of a keyset scan over objects
#[derive(Debug, Clone)]
pub struct ScanQuery {
    pub filter: ScanFilter,
    /// Exclusive lower bound; `None` starts from the beginning of the key space
    pub after: Option<ObjectKey>,
    /// Maximum rows in the page
    pub limit: usize,
    /// Read from a snapshot at this instant where the store supports it
    pub as_of: Option<DateTime<Utc>>,
}

/// Object and segment metadata operations
#[async_trait]
pub trait MetabaseStore: Send + Sync {
    /// Insert a new object; fails with `Duplicate` if the key exists
    async fn insert_object(&self, object: &Object) -> Result<()>;

    /// Insert a new segment; fails with `Duplicate` if the id exists
    async fn insert_segment(&self, segment: &Segment) -> Result<()>;

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>>;

    async fn get_segment(&self, id: &SegmentId) -> Result<Option<Segment>>;

    /// All segments of a stream in position order
    async fn list_segments(&self, stream_id: &StreamId) -> Result<Vec<Segment>>;

    /// Replace a segment's pieces if they still equal `expected` (compared as a set)
    ///
    /// Returns `Conflict` if another writer changed them first and
    /// `SegmentNotFound` if the segment was deleted.
    async fn update_segment_pieces(
        &self,
        id: &SegmentId,
        expected: &[Piece],
        new_pieces: &[Piece],
    ) -> Result<()>;

    /// Read one page of matching objects in ascending key order
    async fn scan_objects(&self, query: &ScanQuery) -> Result<Vec<ObjectStream>>;

    /// Atomically delete an object and every segment of its stream
    ///
    /// Deleting an object that no longer exists is not an error; the
    /// returned counts are zero in that case.
    async fn delete_object(&self, object: &ObjectStream) -> Result<DeletedCounts>;
}
