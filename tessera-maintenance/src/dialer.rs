//! Storage node dialer contract
//!
//! The repairer moves piece bytes through a [`PieceDialer`]. Errors are
//! classified so that every failed transfer maps to a definite audit
//! outcome.

use async_trait::async_trait;
use bytes::Bytes;
use tessera_core::NodeId;
use tessera_overlay::{AuditOutcome, OrderLimit};
use thiserror::Error;

/// Piece transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("Node {node} unreachable: {reason}")]
    Offline { node: NodeId, reason: String },

    #[error("Node {node} does not have the piece")]
    NotFound { node: NodeId },

    #[error("Transfer with node {node} timed out")]
    Timeout { node: NodeId },

    #[error("Protocol error with node {node}: {reason}")]
    Protocol { node: NodeId, reason: String },
}

impl DialError {
    pub fn node(&self) -> NodeId {
        match self {
            Self::Offline { node, .. }
            | Self::NotFound { node }
            | Self::Timeout { node }
            | Self::Protocol { node, .. } => *node,
        }
    }

    /// Audit outcome for a failed download
    pub fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::Offline { .. } | Self::Timeout { .. } => AuditOutcome::Offline,
            Self::NotFound { .. } => AuditOutcome::Failure,
            Self::Protocol { .. } => AuditOutcome::Unknown,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offline { .. } => "offline",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
        }
    }
}

/// Transport to storage nodes
#[async_trait]
pub trait PieceDialer: Send + Sync {
    /// Fetch the piece the order authorizes
    async fn download_piece(&self, order: &OrderLimit) -> Result<Bytes, DialError>;

    /// Store `data` as the piece the order authorizes
    async fn upload_piece(&self, order: &OrderLimit, data: Bytes) -> Result<(), DialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let node = NodeId::random();
        let cases = [
            (
                DialError::Offline {
                    node,
                    reason: "connection refused".into(),
                },
                AuditOutcome::Offline,
            ),
            (DialError::Timeout { node }, AuditOutcome::Offline),
            (DialError::NotFound { node }, AuditOutcome::Failure),
            (
                DialError::Protocol {
                    node,
                    reason: "bad frame".into(),
                },
                AuditOutcome::Unknown,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.audit_outcome(), expected, "{}", err);
            assert_eq!(err.node(), node);
        }
    }
}
