//! Piece bitmap as exchanged in `bitfield` messages.

use bytes::Bytes;

/// Fixed-length bitmap, high bit of the first byte is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitmap for `len` pieces.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Bitmap with every piece set.
    pub fn full(len: usize) -> Self {
        let mut bitfield = Self::new(len);
        for index in 0..len {
            bitfield.set(index);
        }
        bitfield
    }

    /// Validates a wire bitmap against the torrent's piece count.
    ///
    /// Returns `None` when the length is wrong or a spare bit past the last
    /// piece is set.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != len.div_ceil(8) {
            return None;
        }
        let spare_bits = bytes.len() * 8 - len;
        if spare_bits > 0 {
            let mask = (1u8 << spare_bits) - 1;
            if bytes[bytes.len() - 1] & mask != 0 {
                return None;
            }
        }
        Some(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Sets a piece; out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|index| self.has(*index))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bitfield = Bitfield::new(10);
        assert_eq!(bitfield.as_bytes().len(), 2);
        bitfield.set(0);
        bitfield.set(9);
        bitfield.set(42);

        assert!(bitfield.has(0));
        assert!(bitfield.has(9));
        assert!(!bitfield.has(1));
        assert!(!bitfield.has(42));
        assert_eq!(bitfield.count(), 2);
        assert_eq!(bitfield.as_bytes(), &[0x80, 0x40]);
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Bitfield::from_bytes(&[0xff], 8).is_some());
        assert!(Bitfield::from_bytes(&[0xff, 0x00], 8).is_none());
        assert!(Bitfield::from_bytes(&[], 3).is_none());
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xe0], 3).is_some());
        assert!(Bitfield::from_bytes(&[0xf0], 3).is_none());
        assert!(Bitfield::from_bytes(&[0x01], 3).is_none());
    }

    #[test]
    fn test_full_is_complete() {
        let full = Bitfield::full(3);
        assert!(full.is_complete());
        assert_eq!(full.as_bytes(), &[0xe0]);
        assert!(!Bitfield::new(3).is_complete());
    }
}
