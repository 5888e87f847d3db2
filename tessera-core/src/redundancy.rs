//! Redundancy schemes
//!
//! A scheme is the `(required, repair, optimal, total)` tuple of piece
//! counts that governs a segment's durability:
//! - `required`: pieces needed to reconstruct the payload (k)
//! - `repair`: at or below this many healthy pieces the segment is repaired
//! - `optimal`: the target healthy count after upload or repair
//! - `total`: pieces the coder produces (n)

use crate::error::{CoreError, Result};
use crate::MAX_TOTAL_PIECES;
use serde::{Deserialize, Serialize};

/// Health classification for a segment given its reachable piece count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentHealth {
    /// At or above the optimal threshold
    Healthy,
    /// Between the repair and optimal thresholds
    Degraded,
    /// Still reconstructible but below the repair threshold
    AtRisk,
    /// Fewer pieces than required: data loss
    Irreparable,
}

/// Piece-count thresholds of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedundancyScheme {
    pub required: u16,
    pub repair: u16,
    pub optimal: u16,
    pub total: u16,
}

impl RedundancyScheme {
    /// Create a validated scheme
    pub fn new(required: u16, repair: u16, optimal: u16, total: u16) -> Result<Self> {
        let scheme = Self {
            required,
            repair,
            optimal,
            total,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    /// Check `0 < required <= repair <= optimal <= total <= 256` and `required < total`
    pub fn validate(&self) -> Result<()> {
        if self.required == 0 {
            return Err(CoreError::InvalidScheme("required must be > 0".to_string()));
        }
        if !(self.required <= self.repair && self.repair <= self.optimal && self.optimal <= self.total) {
            return Err(CoreError::InvalidScheme(format!(
                "thresholds out of order: {}/{}/{}/{}",
                self.required, self.repair, self.optimal, self.total
            )));
        }
        if self.required >= self.total {
            return Err(CoreError::InvalidScheme(
                "total must exceed required".to_string(),
            ));
        }
        if usize::from(self.total) > MAX_TOTAL_PIECES {
            return Err(CoreError::InvalidScheme(format!(
                "total {} exceeds {}",
                self.total, MAX_TOTAL_PIECES
            )));
        }
        Ok(())
    }

    /// Number of parity pieces (n - k)
    pub fn parity(&self) -> u16 {
        self.total - self.required
    }

    /// Classify a segment's health from its healthy piece count
    pub fn classify(&self, healthy: usize) -> SegmentHealth {
        if healthy < usize::from(self.required) {
            SegmentHealth::Irreparable
        } else if healthy < usize::from(self.repair) {
            SegmentHealth::AtRisk
        } else if healthy < usize::from(self.optimal) {
            SegmentHealth::Degraded
        } else {
            SegmentHealth::Healthy
        }
    }

    /// Healthy pieces divided by required pieces
    pub fn health_ratio(&self, healthy: usize) -> f64 {
        healthy as f64 / f64::from(self.required)
    }

    /// Size of each piece for a payload of `payload_size` bytes
    pub fn piece_size(&self, payload_size: usize) -> usize {
        payload_size.div_ceil(usize::from(self.required))
    }
}
