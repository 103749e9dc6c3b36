use bytes::Bytes;

use super::error::PeerError;

/// Piece availability, one bit per piece, high bit of the first byte first.
///
/// Indices past `piece_count` read as unset and are ignored by setters.
///
/// # Examples
///
/// ```
/// use peerwire::Bitfield;
///
/// let mut bf = Bitfield::new(10);
/// bf.set(0);
/// bf.set(9);
///
/// assert!(bf.has(9));
/// assert!(!bf.has(10));
/// assert_eq!(bf.count(), 2);
/// assert_eq!(bf.as_bytes(), &[0x80, 0x40]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Builds a bitfield from a wire payload.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes long and
    /// every spare bit in the last byte must be zero.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield is {} bytes, expected {}",
                payload.len(),
                expected
            )));
        }

        let bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        if let Some(last) = bf.bits.last() {
            if last & !bf.last_byte_mask() != 0 {
                return Err(PeerError::InvalidMessage("bitfield has spare bits set".into()));
            }
        }
        Ok(bf)
    }

    /// Creates a bitfield with every piece set, as implied by HaveAll.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        if let Some(mask) = bf.bits.last().map(|_| bf.last_byte_mask()) {
            let last = bf.bits.len() - 1;
            bf.bits[last] &= mask;
        }
        bf
    }

    /// Returns true if piece `index` is set.
    pub fn has(&self, index: usize) -> bool {
        index < self.piece_count && self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Marks piece `index` as available.
    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    /// Marks piece `index` as unavailable.
    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(0x80 >> (index % 8));
        }
    }

    /// Clears every piece, as implied by HaveNone.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Number of pieces set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if every piece is set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no piece is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of pieces the bitfield covers.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// The wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Returns true if `self` has at least one piece `ours` is missing.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(ours.bits.iter())
            .any(|(theirs, ours)| theirs & !ours != 0)
    }

    /// Indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    fn last_byte_mask(&self) -> u8 {
        match self.piece_count % 8 {
            0 => 0xFF,
            used => 0xFFu8 << (8 - used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_payload_requires_exact_length() {
        assert!(Bitfield::from_payload(&[0xFF], 10).is_err());
        assert!(Bitfield::from_payload(&[0xFF, 0xC0, 0x00], 10).is_err());
        let bf = Bitfield::from_payload(&[0xFF, 0xC0], 10).unwrap();
        assert!(bf.is_complete());
    }

    #[test]
    fn test_from_payload_rejects_spare_bits() {
        assert!(Bitfield::from_payload(&[0xFF, 0xE0], 10).is_err());
    }

    #[test]
    fn test_full_masks_trailing_bits() {
        let bf = Bitfield::full(10);
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
        assert_eq!(bf.count(), 10);
        assert!(!bf.has(10));
    }

    #[test]
    fn test_has_any_missing_from() {
        let mut ours = Bitfield::new(9);
        let mut theirs = Bitfield::new(9);
        theirs.set(8);
        assert!(theirs.has_any_missing_from(&ours));
        ours.set(8);
        assert!(!theirs.has_any_missing_from(&ours));
        assert_eq!(theirs.ones().collect::<Vec<_>>(), vec![8]);
    }
}
