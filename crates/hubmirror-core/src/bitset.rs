use std::fmt;

use crate::{MirrorError, MirrorErrorKind, MirrorResult};

/// Compact bit-per-block presence map.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8` (least-significant bit first), which is also
/// the order used by the persisted cache header and by the [`fmt::Display`] rendering.
///
/// `size` is the number of addressable bits. It only changes through [`Bitset::grow_to_fit`],
/// which rounds up to whole bytes; the owning cache header keeps the authoritative block count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitset {
    size: u64,
    bits: Vec<u8>,
}

impl Bitset {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            bits: vec![0u8; byte_len(size)],
        }
    }

    /// Rebuild a bitset from persisted bytes.
    pub fn from_bytes(bytes: Vec<u8>, size: u64) -> MirrorResult<Self> {
        if bytes.len() < byte_len(size) {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                format!(
                    "bitset needs {} bytes for {size} bits, got {}",
                    byte_len(size),
                    bytes.len()
                ),
            ));
        }
        Ok(Self { size, bits: bytes })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn set(&mut self, index: u64) -> MirrorResult<()> {
        self.check_index(index)?;
        let (byte, mask) = locate(index);
        self.bits[byte] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, index: u64) -> MirrorResult<()> {
        self.check_index(index)?;
        let (byte, mask) = locate(index);
        self.bits[byte] &= !mask;
        Ok(())
    }

    pub fn test(&self, index: u64) -> MirrorResult<bool> {
        self.check_index(index)?;
        let (byte, mask) = locate(index);
        Ok(self.bits[byte] & mask != 0)
    }

    /// Extend capacity so `index` becomes addressable.
    ///
    /// Growth is byte-granular: after growing, `size` is the byte-aligned bit count covering
    /// `index`, not `index + 1`. New bits start cleared.
    pub fn grow_to_fit(&mut self, index: u64) {
        if index < self.size {
            return;
        }
        let bytes = byte_len(index + 1);
        if bytes > self.bits.len() {
            self.bits.resize(bytes, 0);
        }
        self.size = bytes as u64 * 8;
    }

    /// Number of set bits among the addressable ones.
    pub fn count_ones(&self) -> u64 {
        (0..self.size)
            .filter(|idx| {
                let (byte, mask) = locate(*idx);
                self.bits[byte] & mask != 0
            })
            .count() as u64
    }

    /// True when every bit in `[0, len)` is set. `len` is clamped to `size`.
    pub fn all_set(&self, len: u64) -> bool {
        let len = len.min(self.size);
        let full_bytes = (len / 8) as usize;
        if self.bits[..full_bytes].iter().any(|b| *b != u8::MAX) {
            return false;
        }
        let rem = (len % 8) as u8;
        if rem == 0 {
            return true;
        }
        let mask = (1u16 << rem) as u8 - 1;
        self.bits[full_bytes] & mask == mask
    }

    fn check_index(&self, index: u64) -> MirrorResult<()> {
        if index >= self.size {
            return Err(MirrorError::with_message(
                MirrorErrorKind::OutOfRange,
                format!("bit index {index} out of range for bitset of size {}", self.size),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Bitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bits {
            for bit in 0..8 {
                f.write_str(if byte & (1 << bit) != 0 { "1" } else { "0" })?;
            }
        }
        Ok(())
    }
}

fn byte_len(bits: u64) -> usize {
    bits.div_ceil(8) as usize
}

fn locate(index: u64) -> (usize, u8) {
    ((index / 8) as usize, 1u8 << (index % 8))
}
