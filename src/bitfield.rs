//! # Piece Availability Bitfield
//!
//! A compact record of which pieces a peer has:
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ...
//! ```
//!
//! Bit 7 (MSB) of each byte is the lowest piece index of that byte.

use crate::error::PeerError;

/// Bit-vector of piece possession, one bit per piece.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    /// Builds a bitfield wide enough for `nb_pieces` pieces, all unset.
    pub fn with_pieces(nb_pieces: usize) -> Self {
        Bitfield(vec![0; nb_pieces.div_ceil(8)])
    }

    /// Number of addressable bits.
    pub fn capacity(&self) -> usize {
        self.0.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks whether the piece at `index` is set.
    ///
    /// Indices outside the bitfield are reported as missing.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.0.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Returns a copy of this bitfield with the piece at `index` set.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::IndexOutOfRange`] if `index` is not addressable;
    /// the bitfield never grows.
    pub fn set_piece(&self, index: u32) -> Result<Bitfield, PeerError> {
        let byte_index = (index / 8) as usize;
        if byte_index >= self.0.len() {
            return Err(PeerError::IndexOutOfRange(index));
        }

        let mut bits = self.0.clone();
        bits[byte_index] |= 1 << (7 - index % 8);

        Ok(Bitfield(bits))
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Self {
        Bitfield(bits)
    }
}
