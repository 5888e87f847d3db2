//! Signed order limits
//!
//! An order limit authorizes one node to store or serve one piece. The
//! satellite signs a bincode encoding of every field except the signature;
//! nodes verify it with the satellite's public key before acting.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_core::{
    verify_signature, CoreError, NodeId, PieceId, PieceNumber, SegmentId, SigningIdentity,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Order errors
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Invalid signing identity: {0}")]
    InvalidIdentity(CoreError),

    #[error("Piece size {size} exceeds maximum {max}")]
    PieceTooLarge { size: u64, max: u64 },

    #[error("Order {0} expired")]
    Expired(Uuid),

    #[error("Order {0} has an invalid signature")]
    InvalidSignature(Uuid),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Order recorder error: {0}")]
    Recorder(String),
}

impl OrderError {
    /// Whether the error invalidates every future order, not just this one
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidIdentity(_))
    }
}

pub type Result<T> = std::result::Result<T, OrderError>;

/// What an order allows the node to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PieceAction {
    Get,
    Put,
    GetRepair,
    PutRepair,
}

/// Order configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Orders are valid for this long after creation
    pub expiration_secs: u64,
    /// Largest piece an order may cover
    pub max_piece_size: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 60 * 60,
            max_piece_size: 64 * 1024 * 1024,
        }
    }
}

impl OrderConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

/// A signed authorization for one piece transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial_number: Uuid,
    pub satellite_id: NodeId,
    pub storage_node_id: NodeId,
    pub segment_id: SegmentId,
    pub piece_id: PieceId,
    pub piece_number: PieceNumber,
    pub action: PieceAction,
    /// Maximum bytes covered by the order
    pub limit: u64,
    pub order_created: DateTime<Utc>,
    pub order_expiration: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl OrderLimit {
    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = (
            &self.serial_number,
            &self.satellite_id,
            &self.storage_node_id,
            &self.segment_id,
            &self.piece_id,
            self.piece_number,
            self.action,
            self.limit,
            self.order_created,
            self.order_expiration,
        );
        Ok(bincode::serialize(&unsigned)?)
    }

    /// Check the signature and expiration
    pub fn verify(&self) -> Result<()> {
        self.verify_at(Utc::now())
    }

    pub fn verify_at(&self, now: DateTime<Utc>) -> Result<()> {
        verify_signature(&self.satellite_id, &self.signing_bytes()?, &self.signature)
            .map_err(|_| OrderError::InvalidSignature(self.serial_number))?;
        if now >= self.order_expiration {
            return Err(OrderError::Expired(self.serial_number));
        }
        Ok(())
    }
}

/// Persists issued orders for later settlement
#[async_trait]
pub trait OrderRecorder: Send + Sync {
    async fn record(&self, order: &OrderLimit) -> Result<()>;
}

/// Order recorder that keeps every order in memory
#[derive(Default)]
pub struct MemoryOrderLedger {
    orders: Mutex<Vec<OrderLimit>>,
}

impl MemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Orders issued for one action
    pub fn with_action(&self, action: PieceAction) -> Vec<OrderLimit> {
        self.orders
            .lock()
            .iter()
            .filter(|o| o.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderRecorder for MemoryOrderLedger {
    async fn record(&self, order: &OrderLimit) -> Result<()> {
        self.orders.lock().push(order.clone());
        Ok(())
    }
}

/// Creates signed order limits
pub struct OrderService {
    identity: SigningIdentity,
    config: OrderConfig,
    recorder: std::sync::Arc<dyn OrderRecorder>,
}

impl OrderService {
    /// Fails if the identity cannot produce verifiable signatures
    pub fn new(
        identity: SigningIdentity,
        config: OrderConfig,
        recorder: std::sync::Arc<dyn OrderRecorder>,
    ) -> Result<Self> {
        identity.self_check().map_err(OrderError::InvalidIdentity)?;
        Ok(Self {
            identity,
            config,
            recorder,
        })
    }

    pub fn satellite_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Authorize `node` to store a repaired piece
    pub async fn create_upload_order(
        &self,
        node: NodeId,
        segment: &SegmentId,
        piece_number: PieceNumber,
        piece_size: u64,
    ) -> Result<OrderLimit> {
        self.create_order(node, segment, piece_number, piece_size, PieceAction::PutRepair)
            .await
    }

    /// Authorize fetching a piece from `node` for repair
    pub async fn create_download_order(
        &self,
        node: NodeId,
        segment: &SegmentId,
        piece_number: PieceNumber,
        piece_size: u64,
    ) -> Result<OrderLimit> {
        self.create_order(node, segment, piece_number, piece_size, PieceAction::GetRepair)
            .await
    }

    async fn create_order(
        &self,
        node: NodeId,
        segment: &SegmentId,
        piece_number: PieceNumber,
        piece_size: u64,
        action: PieceAction,
    ) -> Result<OrderLimit> {
        if piece_size > self.config.max_piece_size {
            return Err(OrderError::PieceTooLarge {
                size: piece_size,
                max: self.config.max_piece_size,
            });
        }

        let now = Utc::now();
        let expiration = TimeDelta::from_std(self.config.expiration())
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut order = OrderLimit {
            serial_number: Uuid::new_v4(),
            satellite_id: self.identity.node_id(),
            storage_node_id: node,
            segment_id: *segment,
            piece_id: segment.piece_id(piece_number),
            piece_number,
            action,
            limit: piece_size,
            order_created: now,
            order_expiration: expiration,
            signature: Vec::new(),
        };
        order.signature = self.identity.sign(&order.signing_bytes()?).to_vec();

        self.recorder.record(&order).await?;
        counter!("orders_created_total", "action" => action_label(action)).increment(1);
        debug!(
            serial = %order.serial_number,
            node = %node,
            segment = %segment,
            piece = piece_number,
            action = ?action,
            "Order created"
        );
        Ok(order)
    }
}

fn action_label(action: PieceAction) -> &'static str {
    match action {
        PieceAction::Get => "get",
        PieceAction::Put => "put",
        PieceAction::GetRepair => "get_repair",
        PieceAction::PutRepair => "put_repair",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::{SegmentPosition, StreamId};

    fn service(ledger: Arc<MemoryOrderLedger>) -> OrderService {
        OrderService::new(SigningIdentity::generate(), OrderConfig::default(), ledger).unwrap()
    }

    fn segment() -> SegmentId {
        SegmentId::new(StreamId::new(), SegmentPosition::new(0, 1))
    }

    #[tokio::test]
    async fn test_orders_are_signed_and_recorded() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        let orders = service(ledger.clone());
        let node = NodeId::random();

        let upload = orders.create_upload_order(node, &segment(), 3, 1024).await.unwrap();
        let download = orders.create_download_order(node, &segment(), 4, 1024).await.unwrap();

        assert!(upload.verify().is_ok());
        assert!(download.verify().is_ok());
        assert_eq!(upload.action, PieceAction::PutRepair);
        assert_eq!(download.action, PieceAction::GetRepair);
        assert_ne!(upload.serial_number, download.serial_number);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.with_action(PieceAction::GetRepair).len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_order_fails_verification() {
        let orders = service(Arc::new(MemoryOrderLedger::new()));
        let mut order = orders
            .create_download_order(NodeId::random(), &segment(), 0, 512)
            .await
            .unwrap();
        order.limit = 1 << 30;
        assert!(matches!(order.verify(), Err(OrderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_expired_order() {
        let orders = service(Arc::new(MemoryOrderLedger::new()));
        let order = orders
            .create_upload_order(NodeId::random(), &segment(), 0, 512)
            .await
            .unwrap();
        let later = order.order_expiration + TimeDelta::seconds(1);
        assert!(matches!(order.verify_at(later), Err(OrderError::Expired(_))));
    }

    #[tokio::test]
    async fn test_piece_size_limit() {
        let ledger = Arc::new(MemoryOrderLedger::new());
        let orders = service(ledger.clone());
        let result = orders
            .create_upload_order(NodeId::random(), &segment(), 0, 128 * 1024 * 1024)
            .await;
        assert!(matches!(result, Err(OrderError::PieceTooLarge { .. })));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_invalid_identity_is_fatal() {
        let err = OrderError::InvalidIdentity(CoreError::InvalidSignature);
        assert!(err.is_fatal());
        assert!(!OrderError::Expired(Uuid::nil()).is_fatal());
    }
}
