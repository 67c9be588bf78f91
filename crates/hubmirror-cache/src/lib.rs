use async_trait::async_trait;
use hubmirror_core::{MirrorError, MirrorErrorKind, MirrorResult};
use std::sync::Arc;

pub mod block;
pub mod header;
pub mod stream;

pub use block::{BlockCache, BlockClaim, CacheState, DEFAULT_FLUSH_BLOCKS, FetchTicket};
pub use header::{CACHE_MAGIC, CACHE_PREFIX_LEN, CACHE_VERSION, CacheHeader};
pub use stream::CacheOrchestrator;

/// Backend I/O abstraction for a single cache file.
///
/// Implementations are expected to be internally synchronized; the block cache may call these
/// methods concurrently from multiple tasks.
#[async_trait]
pub trait CacheOps: Send + Sync {
    /// Read bytes at a fixed offset. Returns the number of bytes read, 0 at end of file.
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> MirrorResult<usize>;

    /// Write all bytes at a fixed offset.
    async fn write_at(&self, offset: u64, data: &[u8]) -> MirrorResult<()>;

    /// Current length of the underlying file.
    async fn file_len(&self) -> MirrorResult<u64>;

    /// Resize the underlying file.
    async fn set_len(&self, len: u64) -> MirrorResult<()>;

    /// Make previous writes durable.
    async fn flush(&self) -> MirrorResult<()>;
}

#[async_trait]
impl<T> CacheOps for Arc<T>
where
    T: CacheOps + ?Sized,
{
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> MirrorResult<usize> {
        (**self).read_at(offset, out).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> MirrorResult<()> {
        (**self).write_at(offset, data).await
    }

    async fn file_len(&self) -> MirrorResult<u64> {
        (**self).file_len().await
    }

    async fn set_len(&self, len: u64) -> MirrorResult<()> {
        (**self).set_len(len).await
    }

    async fn flush(&self) -> MirrorResult<()> {
        (**self).flush().await
    }
}

/// Fill `out` from `offset`. Returns `false` if the file ended first.
pub async fn read_exact_at<C: CacheOps + ?Sized>(
    cache: &C,
    mut offset: u64,
    out: &mut [u8],
) -> MirrorResult<bool> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = cache.read_at(offset, &mut out[filled..]).await?;
        if read == 0 {
            return Ok(false);
        }
        filled = filled.checked_add(read).ok_or_else(|| {
            MirrorError::with_message(MirrorErrorKind::OutOfRange, "read size overflow")
        })?;
        offset = offset.checked_add(read as u64).ok_or_else(|| {
            MirrorError::with_message(MirrorErrorKind::OutOfRange, "read offset overflow")
        })?;
    }
    Ok(true)
}

/// In-memory cache file implementation useful for tests and embedded callers.
pub struct MemoryCacheOps {
    state: async_lock::Mutex<Vec<u8>>,
}

impl MemoryCacheOps {
    pub fn new() -> Self {
        Self {
            state: async_lock::Mutex::new(Vec::new()),
        }
    }

    /// Copy of the current file contents.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.clone()
    }
}

impl Default for MemoryCacheOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheOps for MemoryCacheOps {
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> MirrorResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let guard = self.state.lock().await;
        let start = match usize::try_from(offset) {
            Ok(v) => v,
            Err(_) => return Ok(0),
        };
        if start >= guard.len() {
            return Ok(0);
        }
        let available = guard.len() - start;
        let copy_len = available.min(out.len());
        out[..copy_len].copy_from_slice(&guard[start..start + copy_len]);
        Ok(copy_len)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> MirrorResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.lock().await;
        let start = usize::try_from(offset).map_err(|_| {
            MirrorError::with_message(MirrorErrorKind::OutOfRange, "offset exceeds memory cache")
        })?;
        let end = start.checked_add(data.len()).ok_or_else(|| {
            MirrorError::with_message(MirrorErrorKind::OutOfRange, "write overflow")
        })?;
        if end > guard.len() {
            guard.resize(end, 0);
        }
        guard[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn file_len(&self) -> MirrorResult<u64> {
        Ok(self.state.lock().await.len() as u64)
    }

    async fn set_len(&self, len: u64) -> MirrorResult<()> {
        let len = usize::try_from(len).map_err(|_| {
            MirrorError::with_message(MirrorErrorKind::OutOfRange, "length exceeds memory cache")
        })?;
        let mut guard = self.state.lock().await;
        guard.resize(len, 0);
        Ok(())
    }

    async fn flush(&self) -> MirrorResult<()> {
        Ok(())
    }
}
