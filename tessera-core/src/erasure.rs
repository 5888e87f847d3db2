//! Reed-Solomon Erasure Coding
//!
//! Implements `k-of-n` piece coding for a [`RedundancyScheme`] where:
//! - k = `required` data pieces (minimum required to reconstruct)
//! - n - k = parity pieces
//! - any k of the n pieces reconstruct every other piece

use crate::error::{CoreError, Result};
use crate::ids::PieceNumber;
use crate::redundancy::RedundancyScheme;
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// A single erasure-coded piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceData {
    /// Piece number (0 to total-1)
    pub number: PieceNumber,
    /// Piece contents
    pub data: Bytes,
}

impl PieceData {
    pub fn new(number: PieceNumber, data: Bytes) -> Self {
        Self { number, data }
    }

    /// Get piece size
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Reed-Solomon encoder/decoder bound to one scheme
pub struct ErasureEncoder {
    required: usize,
    total: usize,
    encoder: ReedSolomon,
}

impl ErasureEncoder {
    /// Create an encoder for the given scheme
    pub fn for_scheme(scheme: &RedundancyScheme) -> Result<Self> {
        scheme.validate()?;
        let required = usize::from(scheme.required);
        let total = usize::from(scheme.total);
        let encoder = ReedSolomon::new(required, total - required)?;
        Ok(Self {
            required,
            total,
            encoder,
        })
    }

    /// Number of pieces needed to reconstruct
    pub fn required(&self) -> usize {
        self.required
    }

    /// Number of pieces produced
    pub fn total(&self) -> usize {
        self.total
    }

    /// Encode a payload into `total` pieces
    pub fn encode(&self, data: &[u8]) -> Result<Vec<PieceData>> {
        let piece_size = data.len().div_ceil(self.required).max(1);

        // Pad data to be evenly divisible by required
        let mut padded = data.to_vec();
        padded.resize(piece_size * self.required, 0);

        let mut shards: Vec<Vec<u8>> = padded.chunks(piece_size).map(|c| c.to_vec()).collect();
        shards.resize(self.total, vec![0u8; piece_size]);

        // Fills in the parity pieces
        self.encoder.encode(&mut shards)?;

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| PieceData::new(i as PieceNumber, Bytes::from(shard)))
            .collect())
    }

    /// Rebuild every piece from any `required` of them
    ///
    /// `pieces` is indexed by piece number; missing pieces are `None`.
    pub fn reconstruct(&self, pieces: &[Option<Bytes>]) -> Result<Vec<PieceData>> {
        let piece_size = self.check_pieces(pieces)?;

        let mut shards: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .map(|p| p.as_ref().map(|b| b.to_vec()))
            .collect();

        for shard in shards.iter().flatten() {
            if shard.len() != piece_size {
                return Err(CoreError::PieceSizeMismatch {
                    expected: piece_size,
                    actual: shard.len(),
                });
            }
        }

        self.encoder.reconstruct(&mut shards)?;

        shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| {
                shard
                    .map(|s| PieceData::new(i as PieceNumber, Bytes::from(s)))
                    .ok_or_else(|| CoreError::ErasureCoding("Reconstruction failed".to_string()))
            })
            .collect()
    }

    /// Decode pieces back into the original payload
    pub fn decode(&self, pieces: &[Option<Bytes>], original_size: usize) -> Result<Bytes> {
        let piece_size = self.check_pieces(pieces)?;

        let mut shards: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .map(|p| p.as_ref().map(|b| b.to_vec()))
            .collect();
        self.encoder.reconstruct_data(&mut shards)?;

        let mut result = Vec::with_capacity(piece_size * self.required);
        for shard in shards.iter().take(self.required) {
            match shard {
                Some(s) => result.extend_from_slice(s),
                None => return Err(CoreError::ErasureCoding("Reconstruction failed".to_string())),
            }
        }

        result.truncate(original_size);
        Ok(Bytes::from(result))
    }

    /// Verify that a complete piece set is consistent
    pub fn verify(&self, pieces: &[PieceData]) -> Result<bool> {
        if pieces.len() != self.total {
            return Ok(false);
        }
        let expected = pieces.first().map(|p| p.size()).unwrap_or(0);
        if !pieces.iter().all(|p| p.size() == expected) {
            return Ok(false);
        }
        let refs: Vec<&[u8]> = pieces.iter().map(|p| p.data.as_ref()).collect();
        Ok(self.encoder.verify(&refs)?)
    }

    /// Validate piece slots and return the common piece size
    fn check_pieces(&self, pieces: &[Option<Bytes>]) -> Result<usize> {
        if pieces.len() != self.total {
            return Err(CoreError::PieceSizeMismatch {
                expected: self.total,
                actual: pieces.len(),
            });
        }

        let available = pieces.iter().filter(|p| p.is_some()).count();
        if available < self.required {
            return Err(CoreError::InsufficientPieces {
                available,
                required: self.required,
            });
        }

        pieces
            .iter()
            .find_map(|p| p.as_ref().map(|b| b.len()))
            .ok_or(CoreError::InsufficientPieces {
                available: 0,
                required: self.required,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_scheme() -> RedundancyScheme {
        RedundancyScheme::new(3, 4, 4, 5).unwrap()
    }

    fn slots(pieces: &[PieceData]) -> Vec<Option<Bytes>> {
        pieces.iter().map(|p| Some(p.data.clone())).collect()
    }

    #[test]
    fn test_encode_decode_simple() {
        let encoder = ErasureEncoder::for_scheme(&small_scheme()).unwrap();
        let original = b"Hello, Tessera!";

        let pieces = encoder.encode(original).unwrap();
        assert_eq!(pieces.len(), 5);

        let decoded = encoder.decode(&slots(&pieces), original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_reconstruct_missing_pieces() {
        let scheme = RedundancyScheme::new(29, 35, 52, 80).unwrap();
        let encoder = ErasureEncoder::for_scheme(&scheme).unwrap();
        let original: Vec<u8> = (0..29 * 64).map(|i| (i % 251) as u8).collect();
        let pieces = encoder.encode(&original).unwrap();

        // Keep exactly the required count
        let mut available = slots(&pieces);
        for slot in available.iter_mut().skip(29) {
            *slot = None;
        }

        let rebuilt = encoder.reconstruct(&available).unwrap();
        assert_eq!(rebuilt.len(), 80);
        for (rebuilt, original) in rebuilt.iter().zip(pieces.iter()) {
            assert_eq!(rebuilt, original);
        }
    }

    #[test]
    fn test_too_many_missing_pieces() {
        let encoder = ErasureEncoder::for_scheme(&small_scheme()).unwrap();
        let pieces = encoder.encode(b"test data").unwrap();

        let mut available = slots(&pieces);
        available[0] = None;
        available[1] = None;
        available[2] = None;

        let result = encoder.reconstruct(&available);
        assert!(matches!(
            result,
            Err(CoreError::InsufficientPieces {
                available: 2,
                required: 3
            })
        ));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let encoder = ErasureEncoder::for_scheme(&small_scheme()).unwrap();
        let mut pieces = encoder.encode(b"verify test").unwrap();
        assert!(encoder.verify(&pieces).unwrap());

        let mut data = pieces[0].data.to_vec();
        data[0] ^= 0xFF;
        pieces[0].data = Bytes::from(data);
        assert!(!encoder.verify(&pieces).unwrap());
    }

    #[test]
    fn test_piece_numbers() {
        let encoder = ErasureEncoder::for_scheme(&small_scheme()).unwrap();
        let pieces = encoder.encode(b"index test").unwrap();
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(usize::from(piece.number), i);
        }
    }
}
