//! Segment repairer
//!
//! Repairs one queued segment:
//! 1. Load the segment and count pieces on reliable nodes
//! 2. Download `required` verified pieces, replacing failed downloads
//! 3. Reconstruct the missing pieces
//! 4. Upload them to newly selected nodes, with a few spares
//! 5. Swap the piece list if nobody changed it meanwhile
//!
//! Audit outcomes from the download stage are reported to the reputation
//! tracker as each download settles.

use crate::config::{ConfigError, RepairConfig};
use crate::dialer::{DialError, PieceDialer};
use crate::metrics;
use crate::overrides::RepairOverrides;
use crate::queue::{QueueError, RepairJob};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{
    CoreError, ErasureEncoder, NodeId, PieceNumber, RedundancyScheme, SegmentId,
};
use tessera_metabase::{MetabaseError, MetabaseStore, Piece, Segment};
use tessera_overlay::{
    AuditHistoryConfig, AuditOutcome, OrderError, OrderLimit, OrderService, OverlayError,
    OverlayService, ReputationError,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Repair errors
#[derive(Error, Debug)]
pub enum RepairError {
    #[error("Segment {segment}: downloaded {downloaded} verified pieces, need {required}")]
    NotEnoughPiecesDownloaded {
        segment: SegmentId,
        downloaded: usize,
        required: usize,
    },

    #[error("Segment {segment}: not enough replacement nodes: {source}")]
    InsufficientNodes {
        segment: SegmentId,
        source: OverlayError,
    },

    #[error("Segment {segment}: {healthy} healthy pieces after upload, need {needed}")]
    UploadShortfall {
        segment: SegmentId,
        healthy: usize,
        needed: usize,
    },

    #[error("Segment {0} pieces changed during repair")]
    Conflict(SegmentId),

    #[error("Segment {0} repair timed out")]
    Timeout(SegmentId),

    #[error("Metabase error: {0}")]
    Metabase(#[from] MetabaseError),

    #[error("Order error: {0}")]
    Orders(#[from] OrderError),

    #[error("Erasure error: {0}")]
    Erasure(#[from] CoreError),

    #[error("Reputation error: {0}")]
    Reputation(#[from] ReputationError),

    #[error("Piece buffer error: {0}")]
    Buffer(#[from] std::io::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Repair cancelled")]
    Cancelled,
}

impl RepairError {
    /// Errors that must stop the whole service
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Metabase(e) => e.is_fatal(),
            Self::Orders(e) => e.is_fatal(),
            Self::Queue(e) => e.is_fatal(),
            Self::Reputation(_) => true,
            _ => false,
        }
    }

    /// Errors worth another attempt later
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Self::Cancelled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotEnoughPiecesDownloaded { .. } => "not_enough_pieces",
            Self::InsufficientNodes { .. } => "insufficient_nodes",
            Self::UploadShortfall { .. } => "upload_shortfall",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Metabase(_) => "metabase",
            Self::Orders(_) => "orders",
            Self::Erasure(_) => "erasure",
            Self::Reputation(_) => "reputation",
            Self::Buffer(_) => "buffer",
            Self::Queue(_) => "queue",
            Self::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, RepairError>;

/// How a repair attempt ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// New pieces were uploaded and committed
    Repaired {
        retained: usize,
        uploaded: usize,
        healthy_after: usize,
    },
    /// Enough healthy pieces already
    AlreadyHealthy { healthy: usize },
    /// Too few healthy pieces to reconstruct
    Irreparable { healthy: usize, required: u16 },
    /// Segment deleted before or during the repair
    SegmentGone,
    /// Segment expired; it will be collected, not repaired
    Expired,
}

impl RepairOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repaired { .. } => "repaired",
            Self::AlreadyHealthy { .. } => "already_healthy",
            Self::Irreparable { .. } => "irreparable",
            Self::SegmentGone => "segment_gone",
            Self::Expired => "expired",
        }
    }
}

// =============================================================================
// PIECE BUFFER
// =============================================================================

/// Verified downloaded pieces, indexed by piece number
enum PieceBuffer {
    Memory(Vec<Option<Bytes>>),
    Disk {
        dir: tempfile::TempDir,
        files: Vec<Option<PathBuf>>,
    },
}

impl PieceBuffer {
    fn new(total: usize, in_memory: bool, temp_dir: Option<&PathBuf>) -> std::io::Result<Self> {
        if in_memory {
            return Ok(Self::Memory(vec![None; total]));
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("tessera-repair-");
        let dir = match temp_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        Ok(Self::Disk {
            dir,
            files: vec![None; total],
        })
    }

    async fn store(&mut self, number: PieceNumber, data: Bytes) -> std::io::Result<()> {
        let index = usize::from(number);
        match self {
            Self::Memory(slots) => {
                slots[index] = Some(data);
            }
            Self::Disk { dir, files } => {
                let path = dir.path().join(format!("piece-{}", number));
                let target = path.clone();
                tokio::task::spawn_blocking(move || std::fs::write(target, &data))
                    .await
                    .map_err(std::io::Error::other)??;
                files[index] = Some(path);
            }
        }
        Ok(())
    }

    async fn load(&self) -> std::io::Result<Vec<Option<Bytes>>> {
        match self {
            Self::Memory(slots) => Ok(slots.clone()),
            Self::Disk { files, .. } => {
                let files = files.clone();
                tokio::task::spawn_blocking(move || {
                    files
                        .into_iter()
                        .map(|path| path.map(|p| std::fs::read(p).map(Bytes::from)).transpose())
                        .collect::<std::io::Result<Vec<_>>>()
                })
                .await
                .map_err(std::io::Error::other)?
            }
        }
    }
}

// =============================================================================
// REPAIRER
// =============================================================================

/// Result of the download stage
struct Downloaded {
    buffer: PieceBuffer,
    verified: usize,
    /// Nodes whose piece was missing or corrupt
    failed: HashSet<NodeId>,
}

/// Repairs individual segments
pub struct SegmentRepairer {
    metabase: Arc<dyn MetabaseStore>,
    overlay: Arc<OverlayService>,
    orders: Arc<OrderService>,
    dialer: Arc<dyn PieceDialer>,
    config: RepairConfig,
    overrides: RepairOverrides,
    audit_history: AuditHistoryConfig,
}

impl SegmentRepairer {
    pub fn new(
        metabase: Arc<dyn MetabaseStore>,
        overlay: Arc<OverlayService>,
        orders: Arc<OrderService>,
        dialer: Arc<dyn PieceDialer>,
        config: RepairConfig,
        audit_history: AuditHistoryConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let overrides = config.repair_overrides()?;
        Ok(Self {
            metabase,
            overlay,
            orders,
            dialer,
            config,
            overrides,
            audit_history,
        })
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Repair the segment named by `job`
    #[instrument(skip(self, job), fields(segment = %job.segment_id, attempts = job.attempts))]
    pub async fn repair(&self, job: &RepairJob) -> Result<RepairOutcome> {
        let segment_id = job.segment_id;
        let Some(segment) = self.metabase.get_segment(&segment_id).await? else {
            debug!("Segment no longer exists");
            return Ok(RepairOutcome::SegmentGone);
        };
        if segment.is_expired(Utc::now()) {
            debug!("Segment expired, skipping repair");
            return Ok(RepairOutcome::Expired);
        }

        let scheme = self.overrides.apply(segment.redundancy);
        let pieces = unique_by_node(&segment.pieces);
        let node_ids: Vec<NodeId> = pieces.iter().map(|p| p.node_id).collect();
        let reliable = self.overlay.reliable(&node_ids);
        let healthy: Vec<Piece> = pieces
            .into_iter()
            .filter(|p| reliable.contains(&p.node_id))
            .collect();

        let required = usize::from(scheme.required);
        let optimal = usize::from(scheme.optimal);
        metrics::record_segment_health(healthy.len(), scheme.optimal);

        if healthy.len() >= optimal {
            debug!(healthy = healthy.len(), optimal, "Segment already healthy");
            return Ok(RepairOutcome::AlreadyHealthy {
                healthy: healthy.len(),
            });
        }
        if healthy.len() < required {
            warn!(healthy = healthy.len(), required, "Segment irreparable");
            return Ok(RepairOutcome::Irreparable {
                healthy: healthy.len(),
                required: scheme.required,
            });
        }

        // ===== Download =====
        let downloaded = self.download_pieces(&segment, &scheme, &healthy).await?;

        if downloaded.verified < required {
            warn!(
                downloaded = downloaded.verified,
                required, "Not enough pieces downloaded"
            );
            return Err(RepairError::NotEnoughPiecesDownloaded {
                segment: segment_id,
                downloaded: downloaded.verified,
                required,
            });
        }

        // ===== Reconstruct =====
        let encoder = ErasureEncoder::for_scheme(&scheme)?;
        let slots = downloaded.buffer.load().await?;
        let rebuilt = encoder.reconstruct(&slots)?;
        drop(downloaded.buffer);

        // ===== Select =====
        let retained: Vec<Piece> = healthy
            .iter()
            .filter(|p| !downloaded.failed.contains(&p.node_id))
            .copied()
            .collect();
        let new_count = optimal.saturating_sub(retained.len());

        let used_numbers: HashSet<PieceNumber> = retained.iter().map(|p| p.number).collect();
        let free_numbers: Vec<PieceNumber> = (0..scheme.total)
            .filter(|n| !used_numbers.contains(n))
            .collect();
        let spares = spare_count(new_count, self.config.max_excess_rate_over_optimal)
            .min(free_numbers.len().saturating_sub(new_count));

        let targets = self.select_targets(segment_id, new_count, spares, &segment)?;

        // ===== Upload =====
        let mut work: Vec<(PieceNumber, NodeId, Bytes)> = Vec::with_capacity(targets.len());
        for (number, node) in free_numbers.iter().copied().zip(targets) {
            let data = rebuilt[usize::from(number)].data.clone();
            if let Some(hash) = segment.piece_hash(number) {
                if !hash.verify(&data) {
                    return Err(CoreError::ErasureCoding(format!(
                        "rebuilt piece {} does not match its hash",
                        number
                    ))
                    .into());
                }
            }
            work.push((number, node, data));
        }
        let uploaded = self.upload_pieces(&segment, work, new_count).await?;

        let healthy_after = retained.len() + uploaded.len();
        let needed = minimum_success(&scheme, self.config.max_excess_rate_over_optimal);
        if healthy_after < needed {
            warn!(healthy_after, needed, "Too few uploads succeeded");
            return Err(RepairError::UploadShortfall {
                segment: segment_id,
                healthy: healthy_after,
                needed,
            });
        }

        // ===== Commit =====
        let mut new_pieces = retained.clone();
        new_pieces.extend(uploaded.iter().copied());
        match self
            .metabase
            .update_segment_pieces(&segment_id, &segment.pieces, &new_pieces)
            .await
        {
            Ok(()) => {}
            Err(MetabaseError::Conflict(id)) => {
                warn!("Segment pieces changed concurrently");
                return Err(RepairError::Conflict(id));
            }
            Err(MetabaseError::SegmentNotFound(_)) => {
                debug!("Segment deleted during repair");
                return Ok(RepairOutcome::SegmentGone);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            retained = retained.len(),
            uploaded = uploaded.len(),
            healthy_after,
            "Segment repaired"
        );
        Ok(RepairOutcome::Repaired {
            retained: retained.len(),
            uploaded: uploaded.len(),
            healthy_after,
        })
    }

    /// Download until `required` pieces verify or candidates run out
    ///
    /// Each outcome is reported when observed, so it survives the future
    /// being dropped part way.
    async fn download_pieces(
        &self,
        segment: &Segment,
        scheme: &RedundancyScheme,
        healthy: &[Piece],
    ) -> Result<Downloaded> {
        let required = usize::from(scheme.required);
        let piece_size = segment.piece_size();
        let mut buffer = PieceBuffer::new(
            usize::from(scheme.total),
            self.config.in_memory_repair,
            self.config.temp_dir.as_ref(),
        )?;

        let mut candidates = healthy.to_vec();
        candidates.shuffle(&mut rand::thread_rng());
        let mut candidates = candidates.into_iter();

        let mut in_flight = FuturesUnordered::new();
        let mut verified = 0;
        let mut failed = HashSet::new();

        while in_flight.len() < required {
            let Some(piece) = candidates.next() else { break };
            let fut = self.start_download(segment, piece, piece_size).await?;
            in_flight.push(fut);
        }

        while let Some((piece, result)) = in_flight.next().await {
            match result {
                Ok(data) if piece_verifies(segment, piece.number, &data, piece_size) => {
                    metrics::record_piece_transfer("download", "success");
                    metrics::record_repair_bytes("download", data.len() as u64);
                    self.report_outcome(&piece.node_id, AuditOutcome::Success)?;
                    buffer.store(piece.number, data).await?;
                    verified += 1;
                    if verified == required {
                        break;
                    }
                    continue;
                }
                Ok(_) => {
                    warn!(node = %piece.node_id, piece = piece.number, "Downloaded piece failed verification");
                    metrics::record_piece_transfer("download", "corrupt");
                    self.report_outcome(&piece.node_id, AuditOutcome::Failure)?;
                    failed.insert(piece.node_id);
                }
                Err(e) => {
                    warn!(node = %piece.node_id, piece = piece.number, error = %e, "Piece download failed");
                    metrics::record_piece_transfer("download", e.kind());
                    let outcome = e.audit_outcome();
                    if outcome == AuditOutcome::Failure {
                        failed.insert(piece.node_id);
                    }
                    self.report_outcome(&piece.node_id, outcome)?;
                }
            }

            if let Some(next) = candidates.next() {
                let fut = self.start_download(segment, next, piece_size).await?;
                in_flight.push(fut);
            }
        }

        Ok(Downloaded {
            buffer,
            verified,
            failed,
        })
    }

    async fn start_download(
        &self,
        segment: &Segment,
        piece: Piece,
        piece_size: usize,
    ) -> Result<impl Future<Output = (Piece, std::result::Result<Bytes, DialError>)>> {
        let order = self
            .orders
            .create_download_order(piece.node_id, &segment.id, piece.number, piece_size as u64)
            .await?;
        let dialer = self.dialer.clone();
        let timeout = self.config.download_timeout();
        Ok(async move {
            let result = match tokio::time::timeout(timeout, dialer.download_piece(&order)).await {
                Ok(result) => result,
                Err(_) => Err(DialError::Timeout {
                    node: piece.node_id,
                }),
            };
            (piece, result)
        })
    }

    /// Select `new_count` upload targets plus up to `spares` extra
    fn select_targets(
        &self,
        segment_id: SegmentId,
        new_count: usize,
        spares: usize,
        segment: &Segment,
    ) -> Result<Vec<NodeId>> {
        let exclude = segment.node_ids();
        let min_score = self.config.min_node_reputation;
        match self
            .overlay
            .select_replacement(new_count + spares, &exclude, min_score)
        {
            Ok(nodes) => Ok(nodes),
            Err(e) if spares > 0 => {
                debug!(error = %e, "Not enough nodes for spares, selecting exactly the new count");
                self.overlay
                    .select_replacement(new_count, &exclude, min_score)
                    .map_err(|source| RepairError::InsufficientNodes {
                        segment: segment_id,
                        source,
                    })
            }
            Err(source) => Err(RepairError::InsufficientNodes {
                segment: segment_id,
                source,
            }),
        }
    }

    /// Upload pieces keeping `new_count` in flight; later items are spares
    async fn upload_pieces(
        &self,
        segment: &Segment,
        work: Vec<(PieceNumber, NodeId, Bytes)>,
        new_count: usize,
    ) -> Result<Vec<Piece>> {
        let piece_size = segment.piece_size() as u64;
        let mut queue = work.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut uploaded = Vec::with_capacity(new_count);

        while in_flight.len() < new_count {
            let Some((number, node, data)) = queue.next() else { break };
            let fut = self.start_upload(segment, number, node, data, piece_size).await?;
            in_flight.push(fut);
        }

        while let Some((piece, size, result)) = in_flight.next().await {
            match result {
                Ok(()) => {
                    metrics::record_piece_transfer("upload", "success");
                    metrics::record_repair_bytes("upload", size);
                    uploaded.push(piece);
                    if uploaded.len() == new_count {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(node = %piece.node_id, piece = piece.number, error = %e, "Piece upload failed");
                    metrics::record_piece_transfer("upload", e.kind());
                }
            }

            if let Some((number, node, data)) = queue.next() {
                let fut = self.start_upload(segment, number, node, data, piece_size).await?;
                in_flight.push(fut);
            }
        }

        Ok(uploaded)
    }

    async fn start_upload(
        &self,
        segment: &Segment,
        number: PieceNumber,
        node: NodeId,
        data: Bytes,
        piece_size: u64,
    ) -> Result<impl Future<Output = (Piece, u64, std::result::Result<(), DialError>)>> {
        let order = self
            .orders
            .create_upload_order(node, &segment.id, number, piece_size)
            .await?;
        let dialer = self.dialer.clone();
        let timeout = self.config.upload_timeout();
        Ok(async move {
            let size = data.len() as u64;
            let result = match tokio::time::timeout(timeout, dialer.upload_piece(&order, data)).await
            {
                Ok(result) => result,
                Err(_) => Err(DialError::Timeout { node }),
            };
            (Piece::new(number, node), size, result)
        })
    }

    /// Feed one download outcome to reputation and contact state
    fn report_outcome(&self, node: &NodeId, outcome: AuditOutcome) -> Result<()> {
        let now = Utc::now();
        let (record, changed) =
            self.overlay
                .reputation()
                .update(*node, outcome, now, &self.audit_history)?;
        if changed {
            debug!(
                node = %node,
                outcome = outcome.as_str(),
                score = record.audit_score(),
                "Node reputation changed"
            );
        }

        let contact = match outcome {
            AuditOutcome::Offline => self.overlay.mark_offline(node, now),
            _ => self.overlay.record_contact(node, now),
        };
        if let Err(e) = contact {
            debug!(node = %node, error = %e, "Contact state not updated");
        }
        Ok(())
    }
}

/// First piece per node, in piece number order
fn unique_by_node(pieces: &[Piece]) -> Vec<Piece> {
    let mut sorted = pieces.to_vec();
    sorted.sort();
    let mut seen = HashSet::with_capacity(sorted.len());
    sorted.retain(|p| seen.insert(p.node_id));
    sorted
}

fn piece_verifies(segment: &Segment, number: PieceNumber, data: &[u8], piece_size: usize) -> bool {
    match segment.piece_hash(number) {
        Some(hash) => hash.verify(data),
        None => data.len() == piece_size,
    }
}

fn spare_count(new_count: usize, excess_rate: f64) -> usize {
    (new_count as f64 * excess_rate).ceil() as usize
}

/// Healthy pieces a repair must reach to be committed
fn minimum_success(scheme: &RedundancyScheme, excess_rate: f64) -> usize {
    let optimal = usize::from(scheme.optimal);
    let slack = (optimal as f64 * excess_rate).floor() as usize;
    (usize::from(scheme.repair) + 1).max(optimal.saturating_sub(slack))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> RedundancyScheme {
        RedundancyScheme::new(29, 35, 52, 80).unwrap()
    }

    #[test]
    fn test_spare_count_rounds_up() {
        assert_eq!(spare_count(19, 0.05), 1);
        assert_eq!(spare_count(40, 0.05), 2);
        assert_eq!(spare_count(19, 0.0), 0);
    }

    #[test]
    fn test_minimum_success() {
        // 52 - floor(52 * 0.05) = 50
        assert_eq!(minimum_success(&scheme(), 0.05), 50);
        assert_eq!(minimum_success(&scheme(), 0.0), 52);
        // Never below repair + 1
        assert_eq!(minimum_success(&scheme(), 0.9), 36);
    }

    #[test]
    fn test_unique_by_node_keeps_lowest_number() {
        let node = NodeId::random();
        let other = NodeId::random();
        let pieces = [Piece::new(5, node), Piece::new(2, node), Piece::new(3, other)];
        let unique = unique_by_node(&pieces);
        assert_eq!(unique, vec![Piece::new(2, node), Piece::new(3, other)]);
    }

    #[test]
    fn test_error_classification() {
        let segment = SegmentId::new(
            tessera_core::StreamId::new(),
            tessera_core::SegmentPosition::new(0, 0),
        );
        assert!(RepairError::Conflict(segment).is_retryable());
        assert!(RepairError::Timeout(segment).is_retryable());
        assert!(!RepairError::Cancelled.is_retryable());
        assert!(RepairError::Metabase(MetabaseError::Unavailable("down".into())).is_fatal());
        assert!(!RepairError::Metabase(MetabaseError::Conflict(segment)).is_fatal());
    }

    #[tokio::test]
    async fn test_disk_buffer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().to_path_buf();
        let mut buffer = PieceBuffer::new(4, false, Some(&parent)).unwrap();
        buffer.store(2, Bytes::from_static(b"piece two")).await.unwrap();

        let slots = buffer.load().await.unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[2].as_deref(), Some(&b"piece two"[..]));
        assert!(slots[0].is_none());
    }
}
