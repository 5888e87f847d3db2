//! Error types for Tessera core
//!
//! Provides the error type shared by identifiers, schemes and the coder.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient pieces: have {available}, need {required}")]
    InsufficientPieces { available: usize, required: usize },

    #[error("Piece size mismatch: expected {expected}, got {actual}")]
    PieceSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid piece number: {number} (total: {total})")]
    InvalidPieceNumber { number: usize, total: usize },

    // ===== Redundancy Errors =====
    #[error("Invalid redundancy scheme: {0}")]
    InvalidScheme(String),

    // ===== Identity Errors =====
    #[error("Invalid signing identity: {0}")]
    InvalidIdentity(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl From<reed_solomon_erasure::Error> for CoreError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        CoreError::ErasureCoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InsufficientPieces {
            available: 25,
            required: 29,
        };
        assert_eq!(err.to_string(), "Insufficient pieces: have 25, need 29");
    }

    #[test]
    fn test_error_from_reed_solomon() {
        let err: CoreError = reed_solomon_erasure::Error::TooFewShards.into();
        assert!(matches!(err, CoreError::ErasureCoding(_)));
    }
}
