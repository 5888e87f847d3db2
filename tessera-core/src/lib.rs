//! Tessera Core Library
//!
//! Core abstractions shared by the Tessera durability services.
//! This crate provides:
//! - Node, stream, segment and piece identifiers
//! - Redundancy schemes and segment health classification
//! - Reed-Solomon `k-of-n` piece encoding and reconstruction
//! - Signing identities (ed25519) and piece content hashes (Blake3)

pub mod erasure;
pub mod error;
pub mod identity;
pub mod ids;
pub mod redundancy;

pub use erasure::{ErasureEncoder, PieceData};
pub use error::{CoreError, Result};
pub use identity::{verify_signature, ContentHash, SigningIdentity};
pub use ids::{NodeId, PieceId, PieceNumber, SegmentId, SegmentPosition, StreamId};
pub use redundancy::{RedundancyScheme, SegmentHealth};

/// Upper bound on pieces per segment supported by the GF(2^8) coder
pub const MAX_TOTAL_PIECES: usize = 256;
