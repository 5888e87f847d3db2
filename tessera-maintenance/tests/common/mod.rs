//! Shared fixtures: a fake storage network and a wired-up repair environment

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    ContentHash, ErasureEncoder, NodeId, PieceId, RedundancyScheme, SegmentId, SegmentPosition,
    SigningIdentity, StreamId,
};
use tessera_maintenance::{DialError, PieceDialer, RepairConfig, SegmentRepairer};
use tessera_metabase::{MemoryMetabase, MetabaseStore, Piece, Segment};
use tessera_overlay::{
    AuditHistoryConfig, MemoryOrderLedger, NodeInfo, OrderConfig, OrderLimit, OrderService,
    OverlayConfig, OverlayService, ReputationConfig, ReputationTracker,
};

// =============================================================================
// Fake network
// =============================================================================

/// How a fake node responds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Online,
    /// Refuses connections
    Offline,
    /// Serves pieces with a flipped byte
    Corrupt,
    /// Claims not to have any piece
    Missing,
    /// Accepts downloads but fails every upload
    RejectUploads,
    /// Answers after a delay
    Slow(Duration),
}

#[derive(Default)]
pub struct FakeNetwork {
    behaviors: Mutex<HashMap<NodeId, Behavior>>,
    storage: Mutex<HashMap<(NodeId, PieceId), Bytes>>,
    download_attempts: Mutex<HashMap<NodeId, usize>>,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl FakeNetwork {
    pub fn set(&self, node: NodeId, behavior: Behavior) {
        self.behaviors.lock().insert(node, behavior);
    }

    pub fn put(&self, node: NodeId, piece: PieceId, data: Bytes) {
        self.storage.lock().insert((node, piece), data);
    }

    pub fn stored(&self, node: NodeId, piece: PieceId) -> Option<Bytes> {
        self.storage.lock().get(&(node, piece)).cloned()
    }

    pub fn download_attempts(&self, node: &NodeId) -> usize {
        self.download_attempts.lock().get(node).copied().unwrap_or(0)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn behavior(&self, node: &NodeId) -> Behavior {
        self.behaviors
            .lock()
            .get(node)
            .copied()
            .unwrap_or(Behavior::Online)
    }
}

#[async_trait]
impl PieceDialer for FakeNetwork {
    async fn download_piece(&self, order: &OrderLimit) -> Result<Bytes, DialError> {
        let node = order.storage_node_id;
        *self.download_attempts.lock().entry(node).or_default() += 1;
        if let Err(e) = order.verify() {
            return Err(DialError::Protocol {
                node,
                reason: e.to_string(),
            });
        }

        match self.behavior(&node) {
            Behavior::Offline => {
                return Err(DialError::Offline {
                    node,
                    reason: "connection refused".to_string(),
                })
            }
            Behavior::Missing => return Err(DialError::NotFound { node }),
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let data = self
            .stored(node, order.piece_id)
            .ok_or(DialError::NotFound { node })?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        if self.behavior(&node) == Behavior::Corrupt {
            let mut bytes = data.to_vec();
            bytes[0] ^= 0xff;
            return Ok(Bytes::from(bytes));
        }
        Ok(data)
    }

    async fn upload_piece(&self, order: &OrderLimit, data: Bytes) -> Result<(), DialError> {
        let node = order.storage_node_id;
        match self.behavior(&node) {
            Behavior::Offline => {
                return Err(DialError::Offline {
                    node,
                    reason: "connection refused".to_string(),
                })
            }
            Behavior::RejectUploads => {
                return Err(DialError::Protocol {
                    node,
                    reason: "disk full".to_string(),
                })
            }
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }
        self.put(node, order.piece_id, data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Environment
// =============================================================================

pub struct TestEnv {
    pub metabase: Arc<MemoryMetabase>,
    pub reputation: Arc<ReputationTracker>,
    pub overlay: Arc<OverlayService>,
    pub ledger: Arc<MemoryOrderLedger>,
    pub orders: Arc<OrderService>,
    pub network: Arc<FakeNetwork>,
    next_net: AtomicUsize,
}

impl TestEnv {
    pub fn new() -> Self {
        let reputation = Arc::new(ReputationTracker::new(ReputationConfig::default()).unwrap());
        let overlay = Arc::new(OverlayService::new(
            OverlayConfig::default(),
            reputation.clone(),
        ));
        let ledger = Arc::new(MemoryOrderLedger::new());
        let orders = Arc::new(
            OrderService::new(
                SigningIdentity::generate(),
                OrderConfig::default(),
                ledger.clone(),
            )
            .unwrap(),
        );
        Self {
            metabase: Arc::new(MemoryMetabase::new()),
            reputation,
            overlay,
            ledger,
            orders,
            network: Arc::new(FakeNetwork::default()),
            next_net: AtomicUsize::new(0),
        }
    }

    /// Register `count` online nodes, each on its own network
    pub fn add_nodes(&self, count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|_| {
                let n = self.next_net.fetch_add(1, Ordering::SeqCst);
                let node_id = NodeId::random();
                self.overlay.upsert_node(
                    NodeInfo {
                        node_id,
                        address: format!("10.{}.{}.1:7777", n / 256, n % 256),
                        last_net: format!("10.{}.{}.0/24", n / 256, n % 256),
                    },
                    Utc::now(),
                );
                node_id
            })
            .collect()
    }

    /// Make nodes unreachable both in the overlay and on the network
    pub fn take_offline(&self, nodes: &[NodeId]) {
        let later = Utc::now() + TimeDelta::seconds(1);
        for node in nodes {
            self.overlay.mark_offline(node, later).unwrap();
            self.network.set(*node, Behavior::Offline);
        }
    }

    /// Encode a payload and place piece `i` on `holders[i]`
    pub async fn store_segment(&self, scheme: RedundancyScheme, holders: &[NodeId]) -> Segment {
        let payload_size = usize::from(scheme.required) * 64;
        let payload: Vec<u8> = (0..payload_size).map(|i| (i % 251) as u8).collect();
        let encoded = ErasureEncoder::for_scheme(&scheme)
            .unwrap()
            .encode(&payload)
            .unwrap();

        let id = SegmentId::new(StreamId::new(), SegmentPosition::new(0, 0));
        let mut pieces = Vec::with_capacity(holders.len());
        for (number, node) in holders.iter().enumerate() {
            let number = number as u16;
            self.network
                .put(*node, id.piece_id(number), encoded[usize::from(number)].data.clone());
            pieces.push(Piece::new(number, *node));
        }

        let segment = Segment {
            id,
            redundancy: scheme,
            pieces,
            encrypted_size: payload_size as u32,
            piece_hashes: encoded.iter().map(|p| ContentHash::compute(&p.data)).collect(),
            created_at: Utc::now(),
            expires_at: None,
        };
        self.metabase.insert_segment(&segment).await.unwrap();
        segment
    }

    pub async fn segment(&self, id: &SegmentId) -> Segment {
        self.metabase.get_segment(id).await.unwrap().unwrap()
    }

    pub fn repair_config() -> RepairConfig {
        RepairConfig {
            in_memory_repair: true,
            download_timeout_secs: 5,
            upload_timeout_secs: 5,
            ..RepairConfig::default()
        }
    }

    pub fn repairer(&self, config: RepairConfig) -> SegmentRepairer {
        self.repairer_with_store(self.metabase.clone(), config)
    }

    pub fn repairer_with_store(
        &self,
        store: Arc<dyn MetabaseStore>,
        config: RepairConfig,
    ) -> SegmentRepairer {
        SegmentRepairer::new(
            store,
            self.overlay.clone(),
            self.orders.clone(),
            self.network.clone(),
            config,
            AuditHistoryConfig::default(),
        )
        .unwrap()
    }
}

/// Whether every piece in `segment` sits on a distinct node
pub fn distinct_nodes(segment: &Segment) -> bool {
    segment.node_ids().len() == segment.pieces.len()
}
