//! In-memory metabase
//!
//! Keeps objects and segments in ordered maps behind a single lock, so
//! object deletions and piece swaps are atomic with respect to each other.
//! A scan page is read under one read guard, which makes each page a
//! consistent snapshot; `as_of` hides objects created after the instant.

use crate::error::{MetabaseError, Result};
use crate::models::{
    normalize_pieces, same_pieces, DeletedCounts, Object, ObjectKey, ObjectStream, Piece, Segment,
};
use crate::store::{MetabaseStore, ScanQuery};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{SegmentId, SegmentPosition, StreamId};

#[derive(Default)]
struct Tables {
    objects: BTreeMap<ObjectKey, Object>,
    segments: BTreeMap<SegmentId, Segment>,
}

/// Operation counters, used by tests to assert what a component touched
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub piece_updates: AtomicU64,
    pub scans: AtomicU64,
    pub deletes: AtomicU64,
}

/// Metabase held entirely in memory
#[derive(Default)]
pub struct MemoryMetabase {
    tables: RwLock<Tables>,
    stats: MemoryStats,
}

impl MemoryMetabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.tables.read().objects.len()
    }

    /// Number of stored segments
    pub fn segment_count(&self) -> usize {
        self.tables.read().segments.len()
    }

    /// Successful piece swaps so far
    pub fn piece_update_count(&self) -> u64 {
        self.stats.piece_updates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetabaseStore for MemoryMetabase {
    async fn insert_object(&self, object: &Object) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.objects.contains_key(&object.key) {
            return Err(MetabaseError::Duplicate(object.key.to_string()));
        }
        tables.objects.insert(object.key.clone(), object.clone());
        Ok(())
    }

    async fn insert_segment(&self, segment: &Segment) -> Result<()> {
        segment.redundancy.validate()?;
        segment.validate_pieces(&segment.pieces)?;

        let mut tables = self.tables.write();
        if tables.segments.contains_key(&segment.id) {
            return Err(MetabaseError::Duplicate(segment.id.to_string()));
        }
        let mut stored = segment.clone();
        stored.pieces = normalize_pieces(&segment.pieces);
        tables.segments.insert(segment.id, stored);
        Ok(())
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>> {
        Ok(self.tables.read().objects.get(key).cloned())
    }

    async fn get_segment(&self, id: &SegmentId) -> Result<Option<Segment>> {
        Ok(self.tables.read().segments.get(id).cloned())
    }

    async fn list_segments(&self, stream_id: &StreamId) -> Result<Vec<Segment>> {
        let tables = self.tables.read();
        Ok(stream_range(&tables, stream_id)
            .map(|(_, segment)| segment.clone())
            .collect())
    }

    async fn update_segment_pieces(
        &self,
        id: &SegmentId,
        expected: &[Piece],
        new_pieces: &[Piece],
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let segment = tables
            .segments
            .get_mut(id)
            .ok_or(MetabaseError::SegmentNotFound(*id))?;

        if !same_pieces(&segment.pieces, expected) {
            return Err(MetabaseError::Conflict(*id));
        }
        segment.validate_pieces(new_pieces)?;
        segment.pieces = normalize_pieces(new_pieces);

        self.stats.piece_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn scan_objects(&self, query: &ScanQuery) -> Result<Vec<ObjectStream>> {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);

        let tables = self.tables.read();
        let lower = match &query.after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };

        Ok(tables
            .objects
            .range((lower, Bound::Unbounded))
            .map(|(_, object)| object)
            .filter(|object| query.as_of.map_or(true, |at| object.created_at <= at))
            .filter(|object| query.filter.matches(object))
            .take(query.limit)
            .map(Object::object_stream)
            .collect())
    }

    async fn delete_object(&self, object: &ObjectStream) -> Result<DeletedCounts> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);

        let mut tables = self.tables.write();
        let mut counts = DeletedCounts::default();

        let matches = tables
            .objects
            .get(&object.key)
            .is_some_and(|stored| stored.stream_id == object.stream_id);
        if matches {
            tables.objects.remove(&object.key);
            counts.objects = 1;
        }

        let doomed: Vec<SegmentId> = stream_range(&tables, &object.stream_id)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            tables.segments.remove(&id);
            counts.segments += 1;
        }

        Ok(counts)
    }
}

fn stream_range<'a>(
    tables: &'a Tables,
    stream_id: &StreamId,
) -> impl Iterator<Item = (&'a SegmentId, &'a Segment)> {
    let start = SegmentId::new(*stream_id, SegmentPosition::new(0, 0));
    let end = SegmentId::new(*stream_id, SegmentPosition::new(u32::MAX, u32::MAX));
    tables.segments.range(start..=end)
}
