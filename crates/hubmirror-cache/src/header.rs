//! Fixed little-endian header at the start of every cache file.

use hubmirror_core::{Bitset, MirrorError, MirrorErrorKind, MirrorResult};
use tracing::debug;

use crate::{CacheOps, read_exact_at};

pub const CACHE_MAGIC: [u8; 7] = *b"HUBMIRR";
pub const CACHE_VERSION: u8 = 1;
pub const CACHE_PREFIX_LEN: usize = 48;
const DATA_ALIGN: u64 = 4096;
/// Upper bound on blocks per file, which keeps the in-memory mask at 16 MiB or less.
pub const MAX_BLOCK_NUMBER: u64 = 1 << 27;

/// Decoded cache file header.
///
/// `file_size` is the logical size of the upstream file, not the size of the cache file on disk.
/// `block_mask` has at least `block_number` addressable bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    pub version: u8,
    pub block_size: u64,
    pub file_size: u64,
    pub block_number: u64,
    pub created_unix_secs: u64,
    pub block_mask: Bitset,
}

impl CacheHeader {
    /// Header for a fresh cache file with no blocks present.
    pub fn new(file_size: u64, block_size: u64, created_unix_secs: u64) -> MirrorResult<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                "block size must be non-zero power of two",
            ));
        }
        let block_number = file_size.div_ceil(block_size);
        if block_number > MAX_BLOCK_NUMBER || layout_len(block_number.div_ceil(8), file_size).is_none()
        {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                format!("file of {file_size} bytes does not fit a cache with {block_size}-byte blocks"),
            ));
        }
        Ok(Self {
            version: CACHE_VERSION,
            block_size,
            file_size,
            block_number,
            created_unix_secs,
            block_mask: Bitset::new(block_number),
        })
    }

    pub fn mask_len(&self) -> u64 {
        self.block_mask.as_bytes().len() as u64
    }

    /// Offset of block 0, aligned up to 4 KiB past the encoded header.
    pub fn data_offset(&self) -> MirrorResult<u64> {
        data_offset_for(self.mask_len())
            .ok_or_else(|| corrupt(format!("mask of {} bytes overflows the layout", self.mask_len())))
    }

    pub fn expected_file_len(&self) -> MirrorResult<u64> {
        layout_len(self.mask_len(), self.file_size).ok_or_else(|| {
            corrupt(format!(
                "file size {} overflows the cache layout",
                self.file_size
            ))
        })
    }

    /// Length of block `index`. Only the final block may be shorter than `block_size`.
    pub fn block_len(&self, index: u64) -> MirrorResult<u64> {
        if index >= self.block_number {
            return Err(MirrorError::with_message(
                MirrorErrorKind::OutOfRange,
                format!(
                    "block {index} out of range for cache with {} blocks",
                    self.block_number
                ),
            ));
        }
        let start = index * self.block_size;
        Ok(self.block_size.min(self.file_size - start))
    }

    /// Absolute offset of block `index` inside the cache file.
    pub fn block_offset(&self, index: u64) -> MirrorResult<u64> {
        self.block_len(index)?;
        Ok(self.data_offset()? + index * self.block_size)
    }

    /// Absolute offset of the mask byte that holds the bit for block `index`.
    pub fn mask_byte_offset(index: u64) -> u64 {
        CACHE_PREFIX_LEN as u64 + index / 8
    }

    pub fn is_complete(&self) -> bool {
        self.block_mask.all_set(self.block_number)
    }

    pub fn encode_prefix(&self) -> [u8; CACHE_PREFIX_LEN] {
        let mut out = [0u8; CACHE_PREFIX_LEN];
        out[0..7].copy_from_slice(&CACHE_MAGIC);
        out[7] = self.version;
        out[8..16].copy_from_slice(&self.block_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.block_number.to_le_bytes());
        out[32..40].copy_from_slice(&self.created_unix_secs.to_le_bytes());
        out[40..48].copy_from_slice(&self.mask_len().to_le_bytes());
        out
    }

    /// Prefix followed by the mask bytes. Padding up to the data offset is not included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CACHE_PREFIX_LEN + self.block_mask.as_bytes().len());
        out.extend_from_slice(&self.encode_prefix());
        out.extend_from_slice(self.block_mask.as_bytes());
        out
    }

    /// Decode a full header (prefix and mask).
    pub fn decode(bytes: &[u8]) -> MirrorResult<Self> {
        let prefix: &[u8; CACHE_PREFIX_LEN] = bytes
            .get(..CACHE_PREFIX_LEN)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| corrupt("cache header truncated"))?;
        let fields = PrefixFields::decode(prefix)?;
        let mask_end = CACHE_PREFIX_LEN + fields.mask_len as usize;
        let mask = bytes
            .get(CACHE_PREFIX_LEN..mask_end)
            .ok_or_else(|| corrupt("cache block mask truncated"))?;
        fields.into_header(mask.to_vec())
    }

    /// Load and validate the header of an existing cache file.
    ///
    /// Returns `None` for an empty file. Any other malformed state, including a cache file whose
    /// length does not match the header geometry, is reported as [`MirrorErrorKind::Corrupt`].
    pub async fn read_from<C: CacheOps + ?Sized>(ops: &C) -> MirrorResult<Option<Self>> {
        let actual_len = ops.file_len().await?;
        if actual_len == 0 {
            return Ok(None);
        }
        let mut prefix = [0u8; CACHE_PREFIX_LEN];
        if !read_exact_at(ops, 0, &mut prefix).await? {
            return Err(corrupt("cache header truncated"));
        }
        let fields = PrefixFields::decode(&prefix)?;
        // Geometry is validated, so both sums are known not to overflow.
        if actual_len < CACHE_PREFIX_LEN as u64 + fields.mask_len {
            return Err(corrupt("cache block mask truncated"));
        }
        let expected_len = layout_len(fields.mask_len, fields.file_size)
            .ok_or_else(|| corrupt("cache layout overflows"))?;
        if actual_len != expected_len {
            debug!(actual_len, expected_len, "cache file length mismatch");
            return Err(corrupt(format!(
                "cache file is {actual_len} bytes, header expects {expected_len}"
            )));
        }

        let mask_len = usize::try_from(fields.mask_len)
            .map_err(|_| corrupt("cache block mask too large"))?;
        let mut mask = vec![0u8; mask_len];
        if !read_exact_at(ops, CACHE_PREFIX_LEN as u64, &mut mask).await? {
            return Err(corrupt("cache block mask truncated"));
        }
        fields.into_header(mask).map(Some)
    }
}

struct PrefixFields {
    version: u8,
    block_size: u64,
    file_size: u64,
    block_number: u64,
    created_unix_secs: u64,
    mask_len: u64,
}

impl PrefixFields {
    fn decode(prefix: &[u8; CACHE_PREFIX_LEN]) -> MirrorResult<Self> {
        if prefix[0..7] != CACHE_MAGIC {
            return Err(corrupt("cache magic mismatch"));
        }
        if prefix[7] != CACHE_VERSION {
            return Err(corrupt(format!("unsupported cache version {}", prefix[7])));
        }
        let fields = Self {
            version: prefix[7],
            block_size: read_u64(prefix, 8),
            file_size: read_u64(prefix, 16),
            block_number: read_u64(prefix, 24),
            created_unix_secs: read_u64(prefix, 32),
            mask_len: read_u64(prefix, 40),
        };
        fields.validate_geometry()?;
        Ok(fields)
    }

    fn validate_geometry(&self) -> MirrorResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(corrupt(format!("invalid block size {}", self.block_size)));
        }
        if self.block_number != self.file_size.div_ceil(self.block_size) {
            return Err(corrupt(format!(
                "block number {} does not match file size {} with block size {}",
                self.block_number, self.file_size, self.block_size
            )));
        }
        if self.mask_len != self.block_number.div_ceil(8) {
            return Err(corrupt(format!(
                "mask length {} does not cover {} blocks",
                self.mask_len, self.block_number
            )));
        }
        if self.block_number > MAX_BLOCK_NUMBER {
            return Err(corrupt(format!("{} blocks exceed the cache limit", self.block_number)));
        }
        if layout_len(self.mask_len, self.file_size).is_none() {
            return Err(corrupt(format!(
                "file size {} overflows the cache layout",
                self.file_size
            )));
        }
        Ok(())
    }

    fn into_header(self, mask: Vec<u8>) -> MirrorResult<CacheHeader> {
        let block_mask = Bitset::from_bytes(mask, self.block_number)
            .map_err(|err| corrupt(err.to_string()))?;
        Ok(CacheHeader {
            version: self.version,
            block_size: self.block_size,
            file_size: self.file_size,
            block_number: self.block_number,
            created_unix_secs: self.created_unix_secs,
            block_mask,
        })
    }
}

fn data_offset_for(mask_len: u64) -> Option<u64> {
    (CACHE_PREFIX_LEN as u64)
        .checked_add(mask_len)?
        .div_ceil(DATA_ALIGN)
        .checked_mul(DATA_ALIGN)
}

/// Total cache file length: aligned header followed by the file body.
fn layout_len(mask_len: u64, file_size: u64) -> Option<u64> {
    data_offset_for(mask_len)?.checked_add(file_size)
}

fn read_u64(prefix: &[u8; CACHE_PREFIX_LEN], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&prefix[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn corrupt(message: impl Into<String>) -> MirrorError {
    MirrorError::with_message(MirrorErrorKind::Corrupt, message)
}
