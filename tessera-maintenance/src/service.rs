//! Repair worker service
//!
//! Drains the repair queue with a fixed pool of concurrent repairs:
//! - each job runs under the per-job timeout
//! - retryable failures go back on the queue until `max_attempts`
//! - segments that cannot be repaired go to an [`IrreparableSink`]
//! - a fatal error stops intake, waits for running jobs and is returned

use crate::config::RepairConfig;
use crate::metrics;
use crate::queue::{QueueError, RepairJob, RepairQueue};
use crate::segment::{RepairError, RepairOutcome, SegmentRepairer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tessera_core::SegmentId;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Enqueue attempts before a job that cannot be put back is reported
const REQUEUE_ATTEMPTS: u32 = 3;

// =============================================================================
// IRREPARABLE SINK
// =============================================================================

/// A segment given up on
#[derive(Debug, Clone, PartialEq)]
pub struct IrreparableSegment {
    pub segment_id: SegmentId,
    pub attempts: u32,
    pub reason: String,
    pub reported_at: DateTime<Utc>,
}

/// Destination for segments the service could not repair
#[async_trait]
pub trait IrreparableSink: Send + Sync {
    async fn report(&self, segment: IrreparableSegment);
}

/// Sink that only logs
#[derive(Debug, Default)]
pub struct LoggingIrreparableSink;

#[async_trait]
impl IrreparableSink for LoggingIrreparableSink {
    async fn report(&self, segment: IrreparableSegment) {
        error!(
            segment = %segment.segment_id,
            attempts = segment.attempts,
            reason = %segment.reason,
            "Segment irreparable"
        );
    }
}

/// Sink that keeps reports in memory
#[derive(Debug, Default)]
pub struct MemoryIrreparableSink {
    reports: Mutex<Vec<IrreparableSegment>>,
}

impl MemoryIrreparableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<IrreparableSegment> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl IrreparableSink for MemoryIrreparableSink {
    async fn report(&self, segment: IrreparableSegment) {
        error!(
            segment = %segment.segment_id,
            attempts = segment.attempts,
            reason = %segment.reason,
            "Segment irreparable"
        );
        self.reports.lock().push(segment);
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    repaired: AtomicU64,
    already_healthy: AtomicU64,
    irreparable: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Job counts since the service was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub repaired: u64,
    pub already_healthy: u64,
    pub irreparable: u64,
    /// Segments deleted or expired before repair
    pub skipped: u64,
    /// Failed attempts, retried or not
    pub failed: u64,
    pub retried: u64,
}

// =============================================================================
// SERVICE
// =============================================================================

struct Shared {
    queue: Arc<dyn RepairQueue>,
    repairer: Arc<SegmentRepairer>,
    sink: Arc<dyn IrreparableSink>,
    config: RepairConfig,
    counters: Counters,
    /// Cancelled by `close` or a fatal error; stops intake only
    intake: CancellationToken,
    fatal: Mutex<Option<RepairError>>,
}

/// Repair worker pool
pub struct RepairService {
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    permits: u32,
}

impl RepairService {
    pub fn new(
        queue: Arc<dyn RepairQueue>,
        repairer: Arc<SegmentRepairer>,
        sink: Arc<dyn IrreparableSink>,
    ) -> Self {
        let config = repairer.config().clone();
        let permits = u32::try_from(config.max_concurrent_repairs.max(1)).unwrap_or(u32::MAX);
        Self {
            shared: Arc::new(Shared {
                queue,
                repairer,
                sink,
                config,
                counters: Counters::default(),
                intake: CancellationToken::new(),
                fatal: Mutex::new(None),
            }),
            semaphore: Arc::new(Semaphore::new(permits as usize)),
            permits,
        }
    }

    pub fn stats(&self) -> RepairStats {
        let c = &self.shared.counters;
        RepairStats {
            repaired: c.repaired.load(Ordering::Relaxed),
            already_healthy: c.already_healthy.load(Ordering::Relaxed),
            irreparable: c.irreparable.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Process jobs until `cancel` fires, [`close`](Self::close) is called
    /// or a fatal error occurs
    ///
    /// `cancel` also aborts running repairs; their jobs are put back on the
    /// queue unchanged.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RepairError> {
        info!(
            max_concurrent = self.permits,
            per_job_timeout = ?self.shared.config.per_job_timeout(),
            "Repair service started"
        );

        let accept = self.shared.intake.child_token();
        let watcher = {
            let accept = accept.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => accept.cancel(),
                    _ = accept.cancelled() => {}
                }
            })
        };

        loop {
            let permit = tokio::select! {
                _ = accept.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.shared.queue.next(&accept).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    self.shared.fail(e.into());
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to dequeue repair job");
                    drop(permit);
                    tokio::select! {
                        _ = accept.cancelled() => break,
                        _ = tokio::time::sleep(self.shared.config.queue_poll_interval()) => {}
                    }
                    continue;
                }
            };

            metrics::set_active_repairs(self.in_flight());
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            let semaphore = self.semaphore.clone();
            let permits = self.permits;
            tokio::spawn(async move {
                shared.process(job, cancel).await;
                drop(permit);
                metrics::set_active_repairs(in_flight(&semaphore, permits));
            });
        }

        accept.cancel();
        let _ = watcher.await;
        self.drain().await;
        metrics::set_active_repairs(0);
        info!(stats = ?self.stats(), "Repair service stopped");

        match self.shared.fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop taking jobs and wait for running repairs to finish
    pub async fn close(&self) {
        self.shared.intake.cancel();
        self.drain().await;
    }

    fn in_flight(&self) -> usize {
        in_flight(&self.semaphore, self.permits)
    }

    async fn drain(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.permits).await {
            drop(all);
        }
    }
}

fn in_flight(semaphore: &Semaphore, permits: u32) -> usize {
    (permits as usize).saturating_sub(semaphore.available_permits())
}

impl Shared {
    /// Record a fatal error and stop intake; the first error wins
    fn fail(&self, err: RepairError) {
        error!(error = %err, "Fatal repair error, shutting down");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.intake.cancel();
    }

    #[instrument(skip_all, fields(segment = %job.segment_id, attempts = job.attempts))]
    async fn process(&self, job: RepairJob, cancel: CancellationToken) {
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RepairError::Cancelled),
            result = tokio::time::timeout(self.config.per_job_timeout(), self.repairer.repair(&job)) => {
                result.unwrap_or(Err(RepairError::Timeout(job.segment_id)))
            }
        };
        metrics::record_repair_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => self.finish(&job, outcome).await,
            Err(RepairError::Cancelled) => {
                debug!("Repair cancelled, returning job to the queue");
                let _ = self.requeue(job).await;
            }
            Err(e) if e.is_fatal() => {
                metrics::record_repair_failure(e.kind(), false);
                let _ = self.requeue(job).await;
                self.fail(e);
            }
            Err(e) => self.retry(job, e).await,
        }
    }

    async fn finish(&self, job: &RepairJob, outcome: RepairOutcome) {
        metrics::record_repair_outcome(outcome.as_str());
        let c = &self.counters;
        match outcome {
            RepairOutcome::Repaired { .. } => {
                c.repaired.fetch_add(1, Ordering::Relaxed);
            }
            RepairOutcome::AlreadyHealthy { .. } => {
                c.already_healthy.fetch_add(1, Ordering::Relaxed);
            }
            RepairOutcome::Irreparable { healthy, required } => {
                c.irreparable.fetch_add(1, Ordering::Relaxed);
                self.sink
                    .report(IrreparableSegment {
                        segment_id: job.segment_id,
                        attempts: job.attempts + 1,
                        reason: format!("{} healthy pieces, {} required", healthy, required),
                        reported_at: Utc::now(),
                    })
                    .await;
            }
            RepairOutcome::SegmentGone | RepairOutcome::Expired => {
                c.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn retry(&self, job: RepairJob, err: RepairError) {
        let c = &self.counters;
        c.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_repair_failure(err.kind(), true);

        let attempts = job.attempts + 1;
        if attempts >= self.config.max_attempts {
            self.give_up(job.segment_id, attempts, err.to_string()).await;
            return;
        }

        warn!(error = %err, attempts, "Repair failed, retrying later");
        match self.requeue(job.retry()).await {
            Ok(()) => {
                c.retried.fetch_add(1, Ordering::Relaxed);
                metrics::record_repair_retry();
            }
            Err(e) if e.is_fatal() => self.fail(e.into()),
            Err(_) => {}
        }
    }

    /// Put a job back on the queue
    ///
    /// Transient queue errors are retried with a growing delay. A job the
    /// queue still refuses is reported to the sink with the queue error.
    async fn requeue(&self, job: RepairJob) -> Result<(), QueueError> {
        let mut tries = 0;
        let err = loop {
            tries += 1;
            match self.queue.enqueue(job.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() || tries >= REQUEUE_ATTEMPTS => break e,
                Err(e) => {
                    warn!(error = %e, tries, "Failed to requeue repair job, trying again");
                    tokio::time::sleep(self.config.queue_poll_interval() * tries).await;
                }
            }
        };

        error!(error = %err, "Failed to requeue repair job");
        self.give_up(
            job.segment_id,
            job.attempts,
            format!("could not return job to the queue: {}", err),
        )
        .await;
        Err(err)
    }

    async fn give_up(&self, segment_id: SegmentId, attempts: u32, reason: String) {
        self.counters.irreparable.fetch_add(1, Ordering::Relaxed);
        metrics::record_repair_outcome("irreparable");
        self.sink
            .report(IrreparableSegment {
                segment_id,
                attempts,
                reason,
                reported_at: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_flight_counts_held_permits() {
        let semaphore = Arc::new(Semaphore::new(3));
        assert_eq!(in_flight(&semaphore, 3), 0);

        let first = semaphore.clone().acquire_owned().await.unwrap();
        assert_eq!(in_flight(&semaphore, 3), 1);
        let second = semaphore.clone().acquire_owned().await.unwrap();
        assert_eq!(in_flight(&semaphore, 3), 2);

        drop(first);
        assert_eq!(in_flight(&semaphore, 3), 1);
        drop(second);
        assert_eq!(in_flight(&semaphore, 3), 0);
    }
}
