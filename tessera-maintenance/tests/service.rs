//! Repair worker service tests

mod common;

use async_trait::async_trait;
use common::{Behavior, TestEnv};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{RedundancyScheme, SegmentId, StreamId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tessera_maintenance::{
    MemoryIrreparableSink, MemoryRepairQueue, QueueError, RepairError, RepairJob, RepairQueue,
    RepairService, RepairStats,
};
use tessera_metabase::{
    DeletedCounts, MetabaseError, MetabaseStore, Object, ObjectKey, ObjectStream, Piece, Result,
    ScanQuery, Segment,
};
use tokio_util::sync::CancellationToken;

fn scheme() -> RedundancyScheme {
    RedundancyScheme::new(4, 5, 7, 10).unwrap()
}

struct Harness {
    service: Arc<RepairService>,
    queue: Arc<MemoryRepairQueue>,
    sink: Arc<MemoryIrreparableSink>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(env: &TestEnv, store: Option<Arc<dyn MetabaseStore>>, max_attempts: u32) -> Self {
        let mut config = TestEnv::repair_config();
        config.max_attempts = max_attempts;
        config.max_concurrent_repairs = 3;
        config.per_job_timeout_secs = 1;
        let repairer = match store {
            Some(store) => env.repairer_with_store(store, config),
            None => env.repairer(config),
        };

        let queue = Arc::new(MemoryRepairQueue::new());
        let sink = Arc::new(MemoryIrreparableSink::new());
        let service = Arc::new(RepairService::new(
            queue.clone(),
            Arc::new(repairer),
            sink.clone(),
        ));
        Self {
            service,
            queue,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    fn start(&self) -> tokio::task::JoinHandle<std::result::Result<(), RepairError>> {
        let service = self.service.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    }

    /// Poll stats until `done` holds
    async fn wait_for(&self, done: impl Fn(&RepairStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(&self.service.stats()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("service did not reach the expected state");
    }
}

#[tokio::test]
async fn test_drains_queue_and_counts_outcomes() {
    let env = TestEnv::new();
    env.add_nodes(20);

    let mut degraded = Vec::new();
    for _ in 0..3 {
        let holders = env.add_nodes(7);
        env.take_offline(&holders[..2]);
        degraded.push(env.store_segment(scheme(), &holders).await);
    }
    let healthy = env.store_segment(scheme(), &env.add_nodes(7)).await;

    let harness = Harness::new(&env, None, 3);
    for segment in degraded.iter().chain(std::iter::once(&healthy)) {
        harness
            .queue
            .enqueue(RepairJob::new(segment.id, 1.0))
            .await
            .unwrap();
    }

    let handle = harness.start();
    harness
        .wait_for(|s| s.repaired + s.already_healthy == 4)
        .await;
    harness.cancel.cancel();
    handle.await.unwrap().unwrap();

    let stats = harness.service.stats();
    assert_eq!(stats.repaired, 3);
    assert_eq!(stats.already_healthy, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(harness.queue.len().await.unwrap(), 0);
    assert_eq!(env.metabase.piece_update_count(), 3);
    for segment in &degraded {
        assert_eq!(env.segment(&segment.id).await.pieces.len(), 7);
    }
}

#[tokio::test]
async fn test_retries_then_reports_irreparable() {
    let env = TestEnv::new();
    // No spare nodes, so every attempt fails selecting upload targets
    let holders = env.add_nodes(7);
    env.take_offline(&holders[..2]);
    let segment = env.store_segment(scheme(), &holders).await;

    let harness = Harness::new(&env, None, 3);
    harness
        .queue
        .enqueue(RepairJob::new(segment.id, 1.25))
        .await
        .unwrap();

    let handle = harness.start();
    harness.wait_for(|s| s.irreparable == 1).await;
    harness.cancel.cancel();
    handle.await.unwrap().unwrap();

    let stats = harness.service.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.retried, 2);

    let reports = harness.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].segment_id, segment.id);
    assert_eq!(reports[0].attempts, 3);
    assert!(reports[0].reason.contains("replacement nodes"));
    assert_eq!(harness.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_irreparable_segment_reported_once() {
    let env = TestEnv::new();
    env.add_nodes(10);
    let holders = env.add_nodes(7);
    env.take_offline(&holders[..4]);
    let segment = env.store_segment(scheme(), &holders).await;

    let harness = Harness::new(&env, None, 5);
    harness
        .queue
        .enqueue(RepairJob::new(segment.id, 0.75))
        .await
        .unwrap();

    let handle = harness.start();
    harness.wait_for(|s| s.irreparable == 1).await;
    harness.cancel.cancel();
    handle.await.unwrap().unwrap();

    let reports = harness.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempts, 1);
    assert_eq!(harness.service.stats().failed, 0);
    assert_eq!(env.metabase.piece_update_count(), 0);
}

#[tokio::test]
async fn test_job_timeout_is_retryable() {
    let env = TestEnv::new();
    env.add_nodes(10);
    let holders = env.add_nodes(7);
    env.take_offline(&holders[..2]);
    for node in &holders[2..] {
        env.network.set(*node, Behavior::Slow(Duration::from_secs(3)));
    }
    let segment = env.store_segment(scheme(), &holders).await;

    let harness = Harness::new(&env, None, 1);
    harness
        .queue
        .enqueue(RepairJob::new(segment.id, 1.0))
        .await
        .unwrap();

    let handle = harness.start();
    harness.wait_for(|s| s.irreparable == 1).await;
    harness.cancel.cancel();
    handle.await.unwrap().unwrap();

    let reports = harness.sink.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].reason.contains("timed out"));
    assert_eq!(harness.service.stats().failed, 1);
}

#[tokio::test]
async fn test_cancel_returns_running_jobs_to_queue() {
    let env = TestEnv::new();
    env.add_nodes(10);
    let holders = env.add_nodes(7);
    env.take_offline(&holders[..2]);
    for node in &holders[2..] {
        env.network.set(*node, Behavior::Slow(Duration::from_millis(500)));
    }
    let segment = env.store_segment(scheme(), &holders).await;

    let harness = Harness::new(&env, None, 3);
    harness
        .queue
        .enqueue(RepairJob::new(segment.id, 1.0))
        .await
        .unwrap();

    let handle = harness.start();
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.queue.len().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.cancel.cancel();
    handle.await.unwrap().unwrap();

    let requeued = harness.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(requeued.segment_id, segment.id);
    assert_eq!(requeued.attempts, 0);
    assert_eq!(env.metabase.piece_update_count(), 0);
}

#[tokio::test]
async fn test_close_stops_idle_service() {
    let env = TestEnv::new();
    let harness = Harness::new(&env, None, 3);
    let handle = harness.start();

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.service.close().await;
    handle.await.unwrap().unwrap();
    assert_eq!(harness.service.stats(), RepairStats::default());
}

/// Store whose every call fails as if the database were gone
struct UnavailableStore;

fn down<T>() -> Result<T> {
    Err(MetabaseError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl MetabaseStore for UnavailableStore {
    async fn insert_object(&self, _object: &Object) -> Result<()> {
        down()
    }

    async fn insert_segment(&self, _segment: &Segment) -> Result<()> {
        down()
    }

    async fn get_object(&self, _key: &ObjectKey) -> Result<Option<Object>> {
        down()
    }

    async fn get_segment(&self, _id: &SegmentId) -> Result<Option<Segment>> {
        down()
    }

    async fn list_segments(&self, _stream_id: &StreamId) -> Result<Vec<Segment>> {
        down()
    }

    async fn update_segment_pieces(
        &self,
        _id: &SegmentId,
        _expected: &[Piece],
        _new_pieces: &[Piece],
    ) -> Result<()> {
        down()
    }

    async fn scan_objects(&self, _query: &ScanQuery) -> Result<Vec<ObjectStream>> {
        down()
    }

    async fn delete_object(&self, _object: &ObjectStream) -> Result<DeletedCounts> {
        down()
    }
}

#[tokio::test]
async fn test_fatal_error_stops_service() {
    let env = TestEnv::new();
    let harness = Harness::new(&env, Some(Arc::new(UnavailableStore)), 3);
    let segment_id = SegmentId::new(StreamId::new(), Default::default());
    harness
        .queue
        .enqueue(RepairJob::new(segment_id, 1.0))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), harness.start())
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(err) => assert!(err.is_fatal(), "{}", err),
        Ok(()) => panic!("service should stop with the fatal error"),
    }
    // Job survives for the next start
    assert_eq!(harness.queue.len().await.unwrap(), 1);
}

/// Queue that serves queued jobs but refuses new ones once `reject` is set
#[derive(Default)]
struct RejectingQueue {
    inner: MemoryRepairQueue,
    reject: AtomicBool,
    rejected: AtomicUsize,
}

#[async_trait]
impl RepairQueue for RejectingQueue {
    async fn enqueue(&self, job: RepairJob) -> std::result::Result<(), QueueError> {
        if self.reject.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::Invalid("serialization failure".to_string()));
        }
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self) -> std::result::Result<Option<RepairJob>, QueueError> {
        self.inner.dequeue().await
    }

    async fn len(&self) -> std::result::Result<usize, QueueError> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn test_job_reported_when_requeue_fails() {
    let env = TestEnv::new();
    // No spare nodes, so the attempt fails with a retryable error
    let holders = env.add_nodes(7);
    env.take_offline(&holders[..2]);
    let segment = env.store_segment(scheme(), &holders).await;

    let mut config = TestEnv::repair_config();
    config.max_attempts = 5;
    config.queue_poll_interval_ms = 10;
    let queue = Arc::new(RejectingQueue::default());
    queue
        .enqueue(RepairJob::new(segment.id, 1.25))
        .await
        .unwrap();
    queue.reject.store(true, Ordering::SeqCst);

    let sink = Arc::new(MemoryIrreparableSink::new());
    let service = Arc::new(RepairService::new(
        queue.clone(),
        Arc::new(env.repairer(config)),
        sink.clone(),
    ));
    let cancel = CancellationToken::new();
    let handle = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while service.stats().irreparable == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let stats = service.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.irreparable, 1);
    assert_eq!(queue.rejected.load(Ordering::SeqCst), 3);

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].segment_id, segment.id);
    assert_eq!(reports[0].attempts, 1);
    assert!(reports[0].reason.contains("queue"));
}
