//! Fragment bitmaps.
//!
//! A [Bitmap] tracks one bit per fixed-size fragment of a content object.
//! A set bit means the fragment is still outstanding: the receiver still
//! needs it, or the sender still intends to transmit it.
//!
//! Fragment `i` lives in byte `i / 8` at bit `i % 8`, least significant
//! bit first. Bits past the true fragment count are always zero, so a
//! bitmap is complete exactly when every byte is zero.

use crate::*;

/// Size in bytes of one fragment, the unit of transfer.
pub const FRAGMENT_SIZE: usize = 64;

/// Largest bitmap the wire format can carry, in bytes.
pub const MAX_BITMAP_BYTES: usize = u8::MAX as usize;

/// Largest number of fragments a single content object may have.
pub const MAX_FRAGMENTS: usize = MAX_BITMAP_BYTES * 8;

/// Number of fragments needed to carry `size` bytes.
pub fn num_fragments_for(size: u32) -> usize {
    (size as usize).div_ceil(FRAGMENT_SIZE)
}

/// Per-object bit-vector of outstanding fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    key: ContentKey,
    num_bits: usize,
    bytes: Vec<u8>,
}

impl Bitmap {
    /// Construct a bitmap for `size` bytes of content with every fragment
    /// outstanding.
    ///
    /// Fails with [FetchError::InvalidSize] when `size` is zero or needs
    /// more than [MAX_FRAGMENTS] fragments.
    pub fn new(key: ContentKey, size: u32) -> FetchResult<Self> {
        let count = num_fragments_for(size);
        if count == 0 || count > MAX_FRAGMENTS {
            return Err(FetchError::InvalidSize(size));
        }
        Ok(Self::all_set(key, count))
    }

    fn all_set(key: ContentKey, count: usize) -> Self {
        let mut bytes = vec![0xff; count.div_ceil(8)];
        if count % 8 != 0 {
            if let Some(last) = bytes.last_mut() {
                *last = (1 << (count % 8)) - 1;
            }
        }
        Self {
            key,
            num_bits: count,
            bytes,
        }
    }

    /// Reconstruct a bitmap received on the wire.
    ///
    /// The true fragment count is not transmitted, so every bit of the
    /// received bytes is considered addressable.
    pub fn from_wire(key: ContentKey, bytes: Vec<u8>) -> FetchResult<Self> {
        if bytes.len() > MAX_BITMAP_BYTES {
            return Err(FetchError::other(format!(
                "bitmap of {} bytes exceeds {MAX_BITMAP_BYTES}",
                bytes.len()
            )));
        }
        Ok(Self {
            key,
            num_bits: bytes.len() * 8,
            bytes,
        })
    }

    /// The content key this bitmap belongs to.
    pub fn key(&self) -> ContentKey {
        self.key
    }

    /// Number of fragments this bitmap addresses.
    pub fn num_fragments(&self) -> usize {
        self.num_bits
    }

    /// The raw bytes, as carried in a REQUEST.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Is fragment `index` outstanding. Out of range indices never are.
    pub fn is_set(&self, index: u16) -> bool {
        let index = index as usize;
        if index >= self.num_bits {
            return false;
        }
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    /// Mark fragment `index` as no longer outstanding.
    ///
    /// Returns whether the bit was set before.
    pub fn clear(&mut self, index: u16) -> bool {
        if !self.is_set(index) {
            return false;
        }
        let index = index as usize;
        self.bytes[index / 8] &= !(1 << (index % 8));
        true
    }

    /// The lowest outstanding fragment index.
    pub fn first_set(&self) -> Option<u16> {
        let (i, byte) = self
            .bytes
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)?;
        Some((i * 8 + byte.trailing_zeros() as usize) as u16)
    }

    /// Number of outstanding fragments.
    pub fn count_set(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when no fragment is outstanding.
    pub fn is_complete(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Bitwise OR `other` into this bitmap, up to the shorter length.
    pub fn merge(&mut self, other: &Bitmap) {
        self.bytes
            .iter_mut()
            .zip(other.bytes.iter())
            .for_each(|(a, b)| *a |= *b);
        self.mask_tail();
    }

    /// Clear every bit that is set in `other`, up to the shorter length.
    pub fn subtract(&mut self, other: &Bitmap) {
        self.bytes
            .iter_mut()
            .zip(other.bytes.iter())
            .for_each(|(a, b)| *a &= !*b);
    }

    fn mask_tail(&mut self) {
        if self.num_bits % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1 << (self.num_bits % 8)) - 1;
            }
        }
    }
}

impl std::fmt::Display for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "map[{}]:", self.key)?;
        for b in self.bytes.iter() {
            write!(f, " {b:#04x}")?;
        }
        Ok(())
    }
}
