//! Repair queue
//!
//! Jobs are keyed by segment and drained worst health ratio first, oldest
//! first among equals. Enqueueing a segment that is already queued replaces
//! its job. Two implementations:
//! - [`MemoryRepairQueue`]: binary heap woken through `Notify`
//! - [`PostgresRepairQueue`]: `repair_queue` table drained with `SKIP LOCKED`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tessera_core::{SegmentId, SegmentPosition, StreamId};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Repair queue unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid queue entry: {0}")]
    Invalid(String),
}

impl QueueError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => QueueError::Unavailable(err.to_string()),
            other => QueueError::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A segment waiting for repair
#[derive(Debug, Clone, PartialEq)]
pub struct RepairJob {
    pub segment_id: SegmentId,
    /// Healthy pieces divided by required pieces at detection time
    pub health_ratio: f64,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl RepairJob {
    pub fn new(segment_id: SegmentId, health_ratio: f64) -> Self {
        Self {
            segment_id,
            health_ratio,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// The job to re-insert after a failed attempt
    pub fn retry(&self) -> Self {
        Self {
            segment_id: self.segment_id,
            health_ratio: self.health_ratio,
            queued_at: Utc::now(),
            attempts: self.attempts + 1,
        }
    }
}

/// Priority queue of segments to repair
#[async_trait]
pub trait RepairQueue: Send + Sync {
    /// Insert a job, replacing any queued job for the same segment
    async fn enqueue(&self, job: RepairJob) -> Result<()>;

    /// Remove and return the highest-priority job
    async fn dequeue(&self) -> Result<Option<RepairJob>>;

    async fn len(&self) -> Result<usize>;

    /// Delay between dequeue attempts while waiting in [`RepairQueue::next`]
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    /// Wait for a job; `None` once `cancel` fires
    async fn next(&self, cancel: &CancellationToken) -> Result<Option<RepairJob>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.dequeue().await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }
}

// =============================================================================
// IN-MEMORY QUEUE
// =============================================================================

/// Heap entry; stale once the segment is re-enqueued with a newer generation
#[derive(Debug)]
struct Entry {
    health_ratio: f64,
    queued_at: DateTime<Utc>,
    generation: u64,
    segment_id: SegmentId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the lowest ratio, then the oldest job
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .health_ratio
            .total_cmp(&self.health_ratio)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    jobs: HashMap<SegmentId, (u64, RepairJob)>,
    next_generation: u64,
}

/// In-process repair queue
#[derive(Default)]
pub struct MemoryRepairQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryRepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self) -> Option<RepairJob> {
        let mut state = self.state.lock();
        while let Some(entry) = state.heap.pop() {
            let current = state
                .jobs
                .get(&entry.segment_id)
                .is_some_and(|(generation, _)| *generation == entry.generation);
            if current {
                let job = state.jobs.remove(&entry.segment_id).map(|(_, job)| job);
                gauge!("repair_queue_length").set(state.jobs.len() as f64);
                return job;
            }
        }
        None
    }
}

#[async_trait]
impl RepairQueue for MemoryRepairQueue {
    async fn enqueue(&self, job: RepairJob) -> Result<()> {
        if job.health_ratio.is_nan() {
            return Err(QueueError::Invalid(format!(
                "health ratio of {} is NaN",
                job.segment_id
            )));
        }
        {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.heap.push(Entry {
                health_ratio: job.health_ratio,
                queued_at: job.queued_at,
                generation,
                segment_id: job.segment_id,
            });
            state.jobs.insert(job.segment_id, (generation, job));
            gauge!("repair_queue_length").set(state.jobs.len() as f64);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RepairJob>> {
        Ok(self.pop())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().jobs.len())
    }

    async fn next(&self, cancel: &CancellationToken) -> Result<Option<RepairJob>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.pop() {
                return Ok(Some(job));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }
}

// =============================================================================
// POSTGRES QUEUE
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    stream_id: Uuid,
    position: i64,
    health_ratio: f64,
    queued_at: DateTime<Utc>,
    attempts: i32,
}

impl JobRow {
    fn into_job(self) -> Result<RepairJob> {
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| QueueError::Invalid(format!("negative attempts {}", self.attempts)))?;
        Ok(RepairJob {
            segment_id: SegmentId::new(
                StreamId::from_uuid(self.stream_id),
                SegmentPosition::decode(self.position as u64),
            ),
            health_ratio: self.health_ratio,
            queued_at: self.queued_at,
            attempts,
        })
    }
}

/// Durable repair queue in the `repair_queue` table
#[derive(Clone)]
pub struct PostgresRepairQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresRepairQueue {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    /// Refresh the length gauge after a change that already succeeded
    async fn refresh_length(&self) {
        if let Err(e) = self.len().await {
            debug!(error = %e, "Repair queue length not refreshed");
        }
    }
}

#[async_trait]
impl RepairQueue for PostgresRepairQueue {
    #[instrument(skip(self, job), fields(segment = %job.segment_id, attempts = job.attempts))]
    async fn enqueue(&self, job: RepairJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repair_queue (stream_id, position, health_ratio, queued_at, attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream_id, position) DO UPDATE
            SET health_ratio = EXCLUDED.health_ratio,
                queued_at = EXCLUDED.queued_at,
                attempts = EXCLUDED.attempts
            "#,
        )
        .bind(job.segment_id.stream_id.as_uuid())
        .bind(job.segment_id.position.encode() as i64)
        .bind(job.health_ratio)
        .bind(job.queued_at)
        .bind(job.attempts as i32)
        .execute(&self.pool)
        .await?;
        self.refresh_length().await;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RepairJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            DELETE FROM repair_queue
            WHERE (stream_id, position) = (
                SELECT stream_id, position FROM repair_queue
                ORDER BY health_ratio, queued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING stream_id, position, health_ratio, queued_at, attempts
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let job = row.map(JobRow::into_job).transpose()?;
        if let Some(job) = &job {
            debug!(segment = %job.segment_id, attempts = job.attempts, "Dequeued repair job");
            self.refresh_length().await;
        }
        Ok(job)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repair_queue")
            .fetch_one(&self.pool)
            .await?;
        gauge!("repair_queue_length").set(count as f64);
        Ok(count.max(0) as usize)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
