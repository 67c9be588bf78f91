use async_trait::async_trait;
use hubmirror_cache::{BlockCache, CacheOps};
use hubmirror_core::{MirrorError, MirrorErrorKind, MirrorResult};
use std::fs::{File, OpenOptions, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

pub mod registry;

pub use registry::{CacheRegistry, SharedCache};

/// Standard filesystem-backed cache file implementation.
pub struct StdCacheOps {
    path: PathBuf,
    file: Mutex<File>,
}

impl StdCacheOps {
    /// Open or create a cache file at an explicit path, creating parent directories.
    pub fn open_path(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(map_io_err("create cache directory"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(map_io_err("open cache file"))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open an existing cache file without creating it.
    pub fn open_existing(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(map_io_err("open cache file"))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Full path to the underlying cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> MirrorResult<MutexGuard<'_, File>> {
        self.file.lock().map_err(|_| {
            MirrorError::with_message(MirrorErrorKind::Io, "cache file lock poisoned")
        })
    }
}

#[async_trait]
impl CacheOps for StdCacheOps {
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> MirrorResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let file = self.lock_file()?;
        read_file_at(&file, out, offset).map_err(map_io_err("read cache file"))
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> MirrorResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let file = self.lock_file()?;
        write_file_all_at(&file, data, offset).map_err(map_io_err("write cache file"))
    }

    async fn file_len(&self) -> MirrorResult<u64> {
        let file = self.lock_file()?;
        file.metadata()
            .map(|meta| meta.len())
            .map_err(map_io_err("stat cache file"))
    }

    async fn set_len(&self, len: u64) -> MirrorResult<()> {
        let file = self.lock_file()?;
        file.set_len(len).map_err(map_io_err("resize cache file"))
    }

    async fn flush(&self) -> MirrorResult<()> {
        let file = self.lock_file()?;
        file.sync_data().map_err(map_io_err("flush cache file"))
    }
}

/// Write the complete logical file held by `cache` to `dest`.
pub async fn export_to_path<C: CacheOps>(
    cache: &BlockCache<C>,
    dest: impl AsRef<Path>,
) -> MirrorResult<()> {
    let out = StdCacheOps::open_path(dest)?;
    cache.export(&out).await
}

#[cfg(target_family = "unix")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(out, offset)
}

#[cfg(target_family = "windows")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(out, offset)
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
fn read_file_at(_file: &File, _out: &mut [u8], _offset: u64) -> std::io::Result<usize> {
    Err(std::io::Error::other(
        "StdCacheOps is unsupported on this target",
    ))
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.write_at(data, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.seek_write(data, offset)
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
fn write_file_at(_file: &File, _data: &[u8], _offset: u64) -> std::io::Result<usize> {
    Err(std::io::Error::other(
        "StdCacheOps is unsupported on this target",
    ))
}

fn write_file_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        let at = offset
            .checked_add(written as u64)
            .ok_or_else(|| std::io::Error::other("write offset overflow"))?;
        let count = write_file_at(file, &data[written..], at)?;
        if count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write cache file",
            ));
        }
        written += count;
    }
    Ok(())
}

pub(crate) fn map_io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> MirrorError {
    move |err| {
        let message = format!("{op}: {err}");
        MirrorError::with_message(MirrorError::from(err).kind(), message)
    }
}
