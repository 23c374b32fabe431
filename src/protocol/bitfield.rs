//! Piece bitfield
//!
//! A fixed-length bit set over piece indices in the packed wire layout:
//! bit `i` lives in byte `i / 8` at position `7 - i % 8`.

use anyhow::Result;

use crate::error::TorrentError;

/// Number of bytes needed to pack `len` bits.
pub fn num_bytes(len: u32) -> usize {
    (len as usize).div_ceil(8)
}

/// A fixed-length set of piece indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
}

impl Bitfield {
    /// Create an all-zero bitfield of `len` bits
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; num_bytes(len)],
            len,
        }
    }

    /// Create a bitfield with every bit set
    pub fn full(len: u32) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; num_bytes(len)],
            len,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Decode the packed wire form.
    ///
    /// The buffer must be exactly `num_bytes(len)` long. Spare bits in the
    /// last byte are ignored.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self> {
        let expected = num_bytes(len);
        if bytes.len() != expected {
            return Err(TorrentError::validation_error_with_field(
                format!("bitfield must be {} bytes, got {}", expected, bytes.len()),
                "bitfield",
            )
            .into());
        }
        let mut bf = Self {
            bits: bytes.to_vec(),
            len,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    /// Number of bits
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `index`, failing when it is out of range
    pub fn test(&self, index: u32) -> Result<bool> {
        let (byte, mask) = self.locate(index)?;
        Ok(self.bits[byte] & mask != 0)
    }

    /// Like [`Bitfield::test`], but out-of-range indices read as unset
    pub fn has(&self, index: u32) -> bool {
        self.test(index).unwrap_or(false)
    }

    /// Set bit `index`
    pub fn set(&mut self, index: u32) -> Result<()> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] |= mask;
        Ok(())
    }

    /// Clear bit `index`
    pub fn clear(&mut self, index: u32) -> Result<()> {
        let (byte, mask) = self.locate(index)?;
        self.bits[byte] &= !mask;
        Ok(())
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Number of set bits
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Whether every bit is set
    pub fn all(&self) -> bool {
        self.count() == self.len
    }

    /// Indices of set bits, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    /// The packed wire form
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Hex rendering of the packed form, for logs
    pub fn hex(&self) -> String {
        hex::encode(&self.bits)
    }

    fn locate(&self, index: u32) -> Result<(usize, u8)> {
        if index >= self.len {
            return Err(TorrentError::validation_error_with_field(
                format!("bit index {} out of range for length {}", index, self.len),
                "index",
            )
            .into());
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        Ok((byte_index, 1 << bit_index))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.len as usize;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
