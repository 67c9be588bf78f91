//! Maps file identities to cache files under the repository root.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use hubmirror_cache::BlockCache;
use hubmirror_core::{FileIdentity, MirrorError, MirrorErrorKind, MirrorResult};
use tracing::{debug, warn};

use crate::{StdCacheOps, map_io_err};

pub type SharedCache = Arc<BlockCache<StdCacheOps>>;

/// Shares one open [`BlockCache`] per identity across concurrent requests.
///
/// Layout below `root`:
/// - `files/{repo_type}/{org}/{repo}/resolve/{commit}/{path}`: cache files
/// - `refs/{repo_type}/{org}/{repo}/{revision}`: commit a symbolic revision last resolved to
pub struct CacheRegistry {
    root: PathBuf,
    block_size: u64,
    open: async_lock::Mutex<HashMap<FileIdentity, Weak<BlockCache<StdCacheOps>>>>,
}

impl CacheRegistry {
    pub fn new(root: impl Into<PathBuf>, block_size: u64) -> Self {
        Self {
            root: root.into(),
            block_size,
            open: async_lock::Mutex::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// On-disk location of the cache file for `identity`.
    pub fn cache_path(&self, identity: &FileIdentity) -> MirrorResult<PathBuf> {
        let mut path = self.repo_dir("files", identity)?;
        path.push("resolve");
        push_segment(&mut path, &identity.commit)?;
        push_relative(&mut path, &identity.path)?;
        Ok(path)
    }

    fn repo_dir(&self, area: &str, identity: &FileIdentity) -> MirrorResult<PathBuf> {
        let mut path = self.root.join(area).join(identity.repo_type.as_str());
        if let Some(org) = &identity.org {
            push_segment(&mut path, org)?;
        }
        push_segment(&mut path, &identity.repo)?;
        Ok(path)
    }

    /// Open the cache for `identity`, creating it for a file of `file_size` bytes if needed.
    ///
    /// A cache file that fails validation or disagrees with `file_size` is deleted and
    /// recreated, unless another request still has it open; that case fails with
    /// [`MirrorErrorKind::Incomplete`] and leaves the live cache alone.
    pub async fn open_or_create(
        &self,
        identity: &FileIdentity,
        file_size: u64,
    ) -> MirrorResult<SharedCache> {
        let mut open = self.open.lock().await;
        if let Some(cache) = open.get(identity).and_then(Weak::upgrade) {
            if cache.file_size() == file_size {
                return Ok(cache);
            }
            warn!(
                identity = %identity,
                cached_size = cache.file_size(),
                upstream_size = file_size,
                "file size changed while its cache is in use"
            );
            return Err(MirrorError::with_message(
                MirrorErrorKind::Incomplete,
                format!(
                    "cache for {identity} is in use with {} bytes, upstream reports {file_size}",
                    cache.file_size()
                ),
            ));
        }

        let path = self.cache_path(identity)?;
        let ops = StdCacheOps::open_path(&path)?;
        let cache = match BlockCache::open_or_create(ops, file_size, self.block_size).await {
            Ok(cache) => cache,
            Err(err) if err.kind() == MirrorErrorKind::Corrupt => {
                warn!(
                    identity = %identity,
                    path = %path.display(),
                    error = %err,
                    "cache file unusable; recreating"
                );
                fs::remove_file(&path).map_err(map_io_err("remove corrupt cache file"))?;
                let ops = StdCacheOps::open_path(&path)?;
                BlockCache::open_or_create(ops, file_size, self.block_size).await?
            }
            Err(err) => return Err(err),
        };
        debug!(identity = %identity, path = %path.display(), "cache registered");
        let cache = Arc::new(cache);
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(identity.clone(), Arc::downgrade(&cache));
        Ok(cache)
    }

    /// Open an existing cache for `identity` without touching upstream. Returns `None` when no
    /// cache file exists.
    pub async fn open_existing(&self, identity: &FileIdentity) -> MirrorResult<Option<SharedCache>> {
        let mut open = self.open.lock().await;
        if let Some(cache) = open.get(identity).and_then(Weak::upgrade) {
            return Ok(Some(cache));
        }
        let path = self.cache_path(identity)?;
        if !path.is_file() {
            return Ok(None);
        }
        let cache = Arc::new(BlockCache::open_existing(StdCacheOps::open_existing(&path)?).await?);
        open.insert(identity.clone(), Arc::downgrade(&cache));
        Ok(Some(cache))
    }

    /// Remember that `identity.commit` (a branch or tag) resolved to `commit`.
    pub fn record_revision(&self, identity: &FileIdentity, commit: &str) -> MirrorResult<()> {
        if identity.commit == commit {
            return Ok(());
        }
        let mut path = self.repo_dir("refs", identity)?;
        push_relative(&mut path, &identity.commit)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(map_io_err("create refs directory"))?;
        }
        fs::write(&path, commit).map_err(map_io_err("write revision ref"))
    }

    /// Commit recorded for the revision in `identity.commit`, if any.
    pub fn resolve_revision(&self, identity: &FileIdentity) -> MirrorResult<Option<String>> {
        let mut path = self.repo_dir("refs", identity)?;
        push_relative(&mut path, &identity.commit)?;
        match fs::read_to_string(&path) {
            Ok(commit) => Ok(Some(commit.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io_err("read revision ref")(err)),
        }
    }
}

fn push_segment(path: &mut PathBuf, segment: &str) -> MirrorResult<()> {
    if segment.is_empty() || segment.contains(['/', '\\']) || segment == "." || segment == ".." {
        return Err(invalid_path(segment));
    }
    path.push(segment);
    Ok(())
}

/// Append a slash-separated relative path, rejecting anything that could escape `path`.
fn push_relative(path: &mut PathBuf, relative: &str) -> MirrorResult<()> {
    let candidate = Path::new(relative);
    if relative.is_empty()
        || !candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(invalid_path(relative));
    }
    path.push(candidate);
    Ok(())
}

fn invalid_path(value: &str) -> MirrorError {
    MirrorError::with_message(
        MirrorErrorKind::InvalidInput,
        format!("invalid path component '{value}'"),
    )
}
