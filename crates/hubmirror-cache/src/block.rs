use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_channel::oneshot;
use hubmirror_core::{Bitset, MirrorError, MirrorErrorKind, MirrorResult};
use tracing::{debug, trace, warn};

use crate::header::CacheHeader;
use crate::{CacheOps, read_exact_at};

pub const DEFAULT_FLUSH_BLOCKS: u32 = 64;
const COPY_CHUNK_LEN: usize = 1024 * 1024;

/// Population state of a cache file. An absent file has no `BlockCache` at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    Created,
    Partial,
    Complete,
}

struct MaskState {
    mask: Bitset,
    cached_blocks: u64,
    blocks_since_flush: u32,
}

#[derive(Default)]
struct InFlightBlocks {
    waiters: Mutex<BTreeMap<u64, Vec<oneshot::Sender<()>>>>,
}

impl InFlightBlocks {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<oneshot::Sender<()>>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, block: u64) {
        let senders = self.lock().remove(&block).unwrap_or_default();
        trace!(block, waiters = senders.len(), "released in-flight block");
        for sender in senders {
            let _ = sender.send(());
        }
    }
}

/// Exclusive right to fetch one missing block.
///
/// Dropping the ticket wakes every request waiting on the block, whether or not the block was
/// written in the meantime.
pub struct FetchTicket {
    block: u64,
    registry: Arc<InFlightBlocks>,
}

impl FetchTicket {
    pub fn block(&self) -> u64 {
        self.block
    }
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        self.registry.release(self.block);
    }
}

impl fmt::Debug for FetchTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTicket")
            .field("block", &self.block)
            .finish()
    }
}

/// Outcome of [`BlockCache::claim_block`].
#[derive(Debug)]
pub enum BlockClaim {
    /// Block is already cached.
    Present,
    /// Another request is fetching the block; resolves when it finishes or gives up.
    Wait(oneshot::Receiver<()>),
    /// Caller must fetch and write the block.
    Fetch(FetchTicket),
}

/// One cache file holding the blocks of a single remote file.
pub struct BlockCache<C> {
    ops: C,
    block_size: u64,
    file_size: u64,
    block_number: u64,
    created_unix_secs: u64,
    data_offset: u64,
    flush_every_blocks: u32,
    state: async_lock::Mutex<MaskState>,
    in_flight: Arc<InFlightBlocks>,
    write_lock: async_lock::Mutex<()>,
}

impl<C> BlockCache<C>
where
    C: CacheOps,
{
    /// Open the cache file behind `ops`, creating a fresh header if the file is empty.
    ///
    /// An existing file whose geometry differs from `file_size`/`block_size` is reported as
    /// [`MirrorErrorKind::Corrupt`]; callers decide whether to recreate it.
    pub async fn open_or_create(ops: C, file_size: u64, block_size: u64) -> MirrorResult<Self> {
        Self::with_flush_block_limit(ops, file_size, block_size, DEFAULT_FLUSH_BLOCKS).await
    }

    /// Like [`BlockCache::open_or_create`] with a custom mask flush threshold.
    ///
    /// Block data is always synced before its bit is set. The mask itself is synced after
    /// `flush_every_blocks` newly cached blocks and when the file becomes complete.
    pub async fn with_flush_block_limit(
        ops: C,
        file_size: u64,
        block_size: u64,
        flush_every_blocks: u32,
    ) -> MirrorResult<Self> {
        if flush_every_blocks == 0 {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                "flush block limit must be non-zero",
            ));
        }
        let header = match CacheHeader::read_from(&ops).await? {
            Some(header) => {
                if header.file_size != file_size || header.block_size != block_size {
                    debug!(
                        stored_file_size = header.file_size,
                        stored_block_size = header.block_size,
                        expected_file_size = file_size,
                        expected_block_size = block_size,
                        "cache geometry mismatch"
                    );
                    return Err(MirrorError::with_message(
                        MirrorErrorKind::Corrupt,
                        format!(
                            "cache holds {} bytes in {}-byte blocks, expected {file_size} bytes in {block_size}-byte blocks",
                            header.file_size, header.block_size
                        ),
                    ));
                }
                header
            }
            None => {
                let header = CacheHeader::new(file_size, block_size, now_unix_secs())?;
                initialize_cache(&ops, &header).await?;
                header
            }
        };
        Self::from_header(ops, header, flush_every_blocks)
    }

    /// Open an existing cache file without a geometry expectation.
    pub async fn open_existing(ops: C) -> MirrorResult<Self> {
        let header = CacheHeader::read_from(&ops).await?.ok_or_else(|| {
            MirrorError::with_message(MirrorErrorKind::Corrupt, "cache file is empty")
        })?;
        Self::from_header(ops, header, DEFAULT_FLUSH_BLOCKS)
    }

    fn from_header(ops: C, header: CacheHeader, flush_every_blocks: u32) -> MirrorResult<Self> {
        let data_offset = header.data_offset()?;
        let cached_blocks = header.block_mask.count_ones();
        debug!(
            block_size = header.block_size,
            file_size = header.file_size,
            block_number = header.block_number,
            cached_blocks,
            flush_every_blocks,
            "block cache opened"
        );
        Ok(Self {
            block_size: header.block_size,
            file_size: header.file_size,
            block_number: header.block_number,
            created_unix_secs: header.created_unix_secs,
            data_offset,
            flush_every_blocks,
            state: async_lock::Mutex::new(MaskState {
                mask: header.block_mask,
                cached_blocks,
                blocks_since_flush: 0,
            }),
            in_flight: Arc::new(InFlightBlocks::default()),
            write_lock: async_lock::Mutex::new(()),
            ops,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn created_unix_secs(&self) -> u64 {
        self.created_unix_secs
    }

    /// Length of block `index`; only the final block may be short.
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
        Ok(self.block_size.min(self.file_size - index * self.block_size))
    }

    fn block_offset(&self, index: u64) -> u64 {
        self.data_offset + index * self.block_size
    }

    pub async fn is_present(&self, index: u64) -> MirrorResult<bool> {
        self.block_len(index)?;
        self.state.lock().await.mask.test(index)
    }

    /// True when every block in `[first, end)` is cached.
    pub async fn all_present(&self, first: u64, end: u64) -> bool {
        let guard = self.state.lock().await;
        (first..end.min(self.block_number)).all(|idx| guard.mask.test(idx).unwrap_or(false))
    }

    pub async fn cached_blocks(&self) -> u64 {
        self.state.lock().await.cached_blocks
    }

    pub async fn is_complete(&self) -> bool {
        self.cached_blocks().await == self.block_number
    }

    pub async fn state(&self) -> CacheState {
        let cached = self.cached_blocks().await;
        if cached == self.block_number {
            CacheState::Complete
        } else if cached == 0 {
            CacheState::Created
        } else {
            CacheState::Partial
        }
    }

    /// Snapshot of the header as it would be persisted now.
    pub async fn header(&self) -> CacheHeader {
        let guard = self.state.lock().await;
        CacheHeader {
            version: crate::CACHE_VERSION,
            block_size: self.block_size,
            file_size: self.file_size,
            block_number: self.block_number,
            created_unix_secs: self.created_unix_secs,
            block_mask: guard.mask.clone(),
        }
    }

    /// Read a cached block. Returns `None` when the block is absent.
    pub async fn read_block(&self, index: u64) -> MirrorResult<Option<Bytes>> {
        let len = self.block_len(index)?;
        if !self.state.lock().await.mask.test(index)? {
            return Ok(None);
        }
        let mut buf = vec![0u8; len as usize];
        if !read_exact_at(&self.ops, self.block_offset(index), &mut buf).await? {
            warn!(block = index, "cached block is truncated; marking absent");
            self.invalidate(index).await?;
            return Ok(None);
        }
        trace!(block = index, len, "cache hit");
        Ok(Some(Bytes::from(buf)))
    }

    /// Store one block. Returns `false` if the block was already present, in which case nothing
    /// is written.
    pub async fn write_block(&self, index: u64, data: &[u8]) -> MirrorResult<bool> {
        let expected = self.block_len(index)?;
        if data.len() as u64 != expected {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                format!(
                    "block {index} expects {expected} bytes, got {}",
                    data.len()
                ),
            ));
        }

        let _write_guard = self.write_lock.lock().await;
        if self.state.lock().await.mask.test(index)? {
            trace!(block = index, "block already cached; skipping write");
            return Ok(false);
        }

        self.ops.write_at(self.block_offset(index), data).await?;
        self.ops.flush().await?;

        let (mask_offset, mask_byte, should_flush) = {
            let mut guard = self.state.lock().await;
            guard.mask.set(index)?;
            guard.cached_blocks = guard.cached_blocks.saturating_add(1);
            guard.blocks_since_flush = guard.blocks_since_flush.saturating_add(1);
            let should_flush = guard.blocks_since_flush >= self.flush_every_blocks
                || guard.cached_blocks == self.block_number;
            let byte = guard.mask.as_bytes()[(index / 8) as usize];
            (CacheHeader::mask_byte_offset(index), byte, should_flush)
        };
        self.ops.write_at(mask_offset, &[mask_byte]).await?;
        trace!(block = index, len = expected, should_flush, "block cached");
        if should_flush {
            self.flush_locked().await?;
        }
        Ok(true)
    }

    async fn invalidate(&self, index: u64) -> MirrorResult<()> {
        let _write_guard = self.write_lock.lock().await;
        let (mask_offset, mask_byte) = {
            let mut guard = self.state.lock().await;
            if !guard.mask.test(index)? {
                return Ok(());
            }
            guard.mask.clear(index)?;
            guard.cached_blocks = guard.cached_blocks.saturating_sub(1);
            let byte = guard.mask.as_bytes()[(index / 8) as usize];
            (CacheHeader::mask_byte_offset(index), byte)
        };
        self.ops.write_at(mask_offset, &[mask_byte]).await
    }

    /// Sync pending mask writes.
    pub async fn flush(&self) -> MirrorResult<()> {
        let _write_guard = self.write_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> MirrorResult<()> {
        let (blocks_since_flush, cached_blocks) = {
            let guard = self.state.lock().await;
            (guard.blocks_since_flush, guard.cached_blocks)
        };
        debug!(blocks_since_flush, cached_blocks, "flushing cache mask");
        self.ops.flush().await?;
        self.state.lock().await.blocks_since_flush = 0;
        Ok(())
    }

    /// Claim block `index` for fetching, or learn that it is cached or already being fetched.
    pub async fn claim_block(&self, index: u64) -> MirrorResult<BlockClaim> {
        if self.is_present(index).await? {
            return Ok(BlockClaim::Present);
        }
        {
            let mut waiters = self.in_flight.lock();
            if let Some(pending) = waiters.get_mut(&index) {
                let (tx, rx) = oneshot::channel();
                pending.push(tx);
                trace!(block = index, "waiting on in-flight block");
                return Ok(BlockClaim::Wait(rx));
            }
            waiters.insert(index, Vec::new());
        }
        let ticket = FetchTicket {
            block: index,
            registry: Arc::clone(&self.in_flight),
        };
        // A previous fetcher may have finished between the mask check and the claim.
        if self.is_present(index).await? {
            return Ok(BlockClaim::Present);
        }
        trace!(block = index, "claimed block for fetch");
        Ok(BlockClaim::Fetch(ticket))
    }

    /// Copy the logical file body to `dest`. Fails with [`MirrorErrorKind::Incomplete`] unless
    /// every block is cached.
    pub async fn export<D: CacheOps + ?Sized>(&self, dest: &D) -> MirrorResult<()> {
        let cached = self.cached_blocks().await;
        if cached != self.block_number {
            return Err(MirrorError::with_message(
                MirrorErrorKind::Incomplete,
                format!("{cached} of {} blocks cached", self.block_number),
            ));
        }
        dest.set_len(0).await?;
        let mut buf = vec![0u8; COPY_CHUNK_LEN];
        let mut copied = 0u64;
        while copied < self.file_size {
            let len = (self.file_size - copied).min(COPY_CHUNK_LEN as u64) as usize;
            let chunk = &mut buf[..len];
            if !read_exact_at(&self.ops, self.data_offset + copied, chunk).await? {
                return Err(MirrorError::with_message(
                    MirrorErrorKind::Corrupt,
                    "cache file ended before the last block",
                ));
            }
            dest.write_at(copied, chunk).await?;
            copied += len as u64;
        }
        dest.set_len(self.file_size).await?;
        dest.flush().await?;
        debug!(bytes = copied, "cache exported");
        Ok(())
    }
}

async fn initialize_cache<C: CacheOps>(ops: &C, header: &CacheHeader) -> MirrorResult<()> {
    ops.set_len(0).await?;
    ops.set_len(header.expected_file_len()?).await?;
    ops.write_at(0, &header.encode()).await?;
    ops.flush().await?;
    debug!(
        block_size = header.block_size,
        file_size = header.file_size,
        block_number = header.block_number,
        "cache file initialized"
    );
    Ok(())
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
