use crate::error::{BittorrentError, Result};

/// Set of piece indices a peer claims to have, stored MSB-first as on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// No pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Every piece (a seeder)
    pub fn full(num_pieces: usize) -> Self {
        let mut bitfield = Self::new(num_pieces);
        (0..num_pieces).for_each(|i| {
            bitfield.set(i);
        });
        bitfield
    }

    /// Validate a received bitfield payload; spare trailing bits are ignored
    pub fn from_payload(payload: &[u8], num_pieces: usize) -> Result<Self> {
        let expected = num_pieces.div_ceil(8);
        if payload.len() != expected {
            return Err(BittorrentError::Protocol(format!(
                "Bitfield of {} bytes, expected {}",
                payload.len(),
                expected
            )));
        }

        let mut bytes = payload.to_vec();
        let spare = expected * 8 - num_pieces;
        if let Some(last) = bytes.last_mut() {
            *last &= 0xffu8 << spare;
        }

        Ok(Self { bytes, num_pieces })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        (self.bytes[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Mark `index` present; returns whether it was newly added
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.num_pieces || self.has(index) {
            return false;
        }
        self.bytes[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |&i| self.has(i))
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let bitfield = Bitfield::from_payload(&[0b1010_0000, 0b1000_0000], 9).unwrap();

        assert_eq!(bitfield.iter().collect::<Vec<_>>(), vec![0, 2, 8]);
        assert!(!bitfield.has(1));
        assert!(!bitfield.has(100));
    }

    #[test]
    fn test_spare_bits_are_masked() {
        let bitfield = Bitfield::from_payload(&[0xff], 3).unwrap();
        assert_eq!(bitfield.count(), 3);
        assert_eq!(bitfield, Bitfield::full(3));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(Bitfield::from_payload(&[0xff, 0x00], 8).is_err());
        assert!(Bitfield::from_payload(&[], 1).is_err());
    }

    #[test]
    fn test_set_reports_new_pieces() {
        let mut bitfield = Bitfield::new(4);
        assert!(bitfield.set(3));
        assert!(!bitfield.set(3));
        assert!(!bitfield.set(4));
        assert_eq!(bitfield.as_bytes(), &[0b0001_0000]);
    }
}
