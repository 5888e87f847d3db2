//! Metadata garbage collection
//!
//! Two passes share one cursor-paged loop:
//! - expired objects: committed objects whose expiration is in the past
//! - zombie objects: pending uploads abandoned past their deadline
//!
//! Each object (row plus all of its segments) is deleted as one atomic
//! unit. A failed unit is reported and left for the next pass; the cursor
//! still advances past it so a pass always terminates.

use crate::error::{MetabaseError, Result};
use crate::models::{DeletedCounts, ObjectStream};
use crate::store::{MetabaseStore, ScanFilter, ScanQuery};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on objects read per page
pub const DELETE_BATCH_SIZE_LIMIT: usize = 1000;

/// Clamp a requested batch size into `1..=DELETE_BATCH_SIZE_LIMIT`
///
/// Zero means "use the maximum".
pub fn clamp_batch_size(requested: usize) -> usize {
    if requested == 0 || requested > DELETE_BATCH_SIZE_LIMIT {
        DELETE_BATCH_SIZE_LIMIT
    } else {
        requested
    }
}

/// Garbage collection pass kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPass {
    Expired,
    Zombie,
}

impl GcPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Zombie => "zombie",
        }
    }
}

impl std::fmt::Display for GcPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for deleting expired objects
#[derive(Debug, Clone)]
pub struct DeleteExpiredObjects {
    /// Delete objects that expired strictly before this instant
    pub expired_before: DateTime<Utc>,
    /// Snapshot time for page reads
    pub as_of_system_time: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

/// Options for deleting zombie (abandoned pending) objects
#[derive(Debug, Clone)]
pub struct DeleteZombieObjects {
    /// Delete pending objects whose deadline is strictly before this instant
    pub deadline_before: DateTime<Utc>,
    /// Snapshot time for page reads
    pub as_of_system_time: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

/// A deletion unit that failed and stays in place for the next pass
#[derive(Debug)]
pub struct UnitFailure {
    pub object: ObjectStream,
    pub error: MetabaseError,
}

/// Outcome of one full pass
#[derive(Debug)]
pub struct GcReport {
    pub pass: GcPass,
    /// Pages read
    pub batches: u64,
    pub objects_scanned: u64,
    pub objects_deleted: u64,
    pub segments_deleted: u64,
    pub failures: Vec<UnitFailure>,
    /// The pass stopped early because cancellation was requested
    pub cancelled: bool,
}

impl GcReport {
    fn new(pass: GcPass) -> Self {
        Self {
            pass,
            batches: 0,
            objects_scanned: 0,
            objects_deleted: 0,
            segments_deleted: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    /// Every visited unit was deleted
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

/// Runs garbage collection passes against a metabase store
#[derive(Clone)]
pub struct MetabaseGc {
    store: Arc<dyn MetabaseStore>,
    cancel: CancellationToken,
}

impl MetabaseGc {
    pub fn new(store: Arc<dyn MetabaseStore>) -> Self {
        Self {
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop passes between pages once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Delete every committed object that expired before `opts.expired_before`
    pub async fn delete_expired_objects(&self, opts: DeleteExpiredObjects) -> Result<GcReport> {
        self.run_pass(
            GcPass::Expired,
            ScanFilter::ExpiredBefore(opts.expired_before),
            opts.as_of_system_time,
            opts.batch_size,
        )
        .await
    }

    /// Delete every pending object whose zombie deadline passed before `opts.deadline_before`
    pub async fn delete_zombie_objects(&self, opts: DeleteZombieObjects) -> Result<GcReport> {
        self.run_pass(
            GcPass::Zombie,
            ScanFilter::ZombieBefore(opts.deadline_before),
            opts.as_of_system_time,
            opts.batch_size,
        )
        .await
    }

    #[instrument(skip(self, filter, as_of), fields(pass = %pass))]
    async fn run_pass(
        &self,
        pass: GcPass,
        filter: ScanFilter,
        as_of: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<GcReport> {
        let batch_size = clamp_batch_size(batch_size);
        let started = Instant::now();
        let mut report = GcReport::new(pass);
        let mut query = ScanQuery {
            filter,
            after: None,
            limit: batch_size,
            as_of,
        };

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let page = self.store.scan_objects(&query).await?;
            if page.is_empty() {
                break;
            }
            report.batches += 1;
            report.objects_scanned += page.len() as u64;
            debug!(batch = report.batches, objects = page.len(), "Processing GC batch");

            for object in &page {
                match self.store.delete_object(object).await {
                    Ok(counts) => record_deleted(pass, object, counts, &mut report),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            pass = %pass,
                            key = %object.key,
                            stream_id = %object.stream_id,
                            error = %e,
                            "Failed to delete object"
                        );
                        counter!("metabase_gc_failures_total", "pass" => pass.as_str())
                            .increment(1);
                        report.failures.push(UnitFailure {
                            object: object.clone(),
                            error: e,
                        });
                    }
                }
            }

            // Short page: nothing left past it
            if page.len() < batch_size {
                break;
            }
            query.after = page.last().map(|o| o.key.clone());
        }

        counter!("metabase_gc_batches_total", "pass" => pass.as_str()).increment(report.batches);
        histogram!("metabase_gc_pass_duration_seconds", "pass" => pass.as_str())
            .record(started.elapsed().as_secs_f64());

        info!(
            pass = %pass,
            batches = report.batches,
            objects_deleted = report.objects_deleted,
            segments_deleted = report.segments_deleted,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "GC pass complete"
        );
        Ok(report)
    }
}

fn record_deleted(pass: GcPass, object: &ObjectStream, counts: DeletedCounts, report: &mut GcReport) {
    if counts.objects == 0 {
        debug!(key = %object.key, "Object already deleted");
    } else {
        info!(
            pass = %pass,
            project_id = %object.key.project_id,
            bucket = %object.key.bucket_name,
            key = %String::from_utf8_lossy(&object.key.object_key),
            version = object.key.version,
            stream_id = %object.stream_id,
            segments = counts.segments,
            "Deleted object"
        );
    }

    report.objects_deleted += counts.objects;
    report.segments_deleted += counts.segments;
    counter!("metabase_gc_objects_deleted_total", "pass" => pass.as_str())
        .increment(counts.objects);
    counter!("metabase_gc_segments_deleted_total", "pass" => pass.as_str())
        .increment(counts.segments);
}
