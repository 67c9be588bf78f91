//! Ordered fallback chain of file sources.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use hubmirror_cache::CacheOrchestrator;
use hubmirror_cache_store_std::{CacheRegistry, SharedCache};
use hubmirror_core::{
    FileIdentity, FileResponse, MirrorErrorKind, MirrorResult, RangePlan, RepoType,
    RequestMethod, UpstreamFetch, etag_value,
};
use hubmirror_http::{UpstreamClient, UpstreamMeta};
use tracing::{debug, info, warn};

use crate::model_bin::{ModelBinStore, open_file_response};

#[derive(Clone, Debug)]
pub struct FileRequest {
    pub identity: FileIdentity,
    pub range: Option<String>,
    pub method: RequestMethod,
}

/// One place a file may be served from. `Ok(None)` passes the request to the next source.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, request: &FileRequest) -> MirrorResult<Option<FileResponse>>;
}

/// Local model directories, consulted before the cache.
pub struct ModelBinSource {
    store: ModelBinStore,
}

impl ModelBinSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: ModelBinStore::new(root),
        }
    }

    pub fn store(&self) -> &ModelBinStore {
        &self.store
    }
}

#[async_trait]
impl FileSource for ModelBinSource {
    fn name(&self) -> &'static str {
        "model-bin"
    }

    async fn open(&self, request: &FileRequest) -> MirrorResult<Option<FileResponse>> {
        let identity = &request.identity;
        if identity.repo_type != RepoType::Models {
            return Ok(None);
        }
        let Some(path) =
            self.store
                .file_path(identity.org.as_deref(), &identity.repo, &identity.path)?
        else {
            return Ok(None);
        };
        let response = open_file_response(
            &path,
            request.range.as_deref(),
            request.method,
            Some(identity.commit.as_str()),
        )
        .await?;
        Ok(Some(response))
    }
}

/// Block cache backed by the upstream hub, or by the cache alone when offline.
pub struct CachedUpstreamSource {
    registry: Arc<CacheRegistry>,
    upstream: Option<Arc<UpstreamClient>>,
}

impl CachedUpstreamSource {
    pub fn new(registry: Arc<CacheRegistry>, upstream: Option<Arc<UpstreamClient>>) -> Self {
        Self { registry, upstream }
    }

    async fn open_online(
        &self,
        upstream: &Arc<UpstreamClient>,
        request: &FileRequest,
    ) -> MirrorResult<FileResponse> {
        // A pinned commit never changes, so an existing cache file already records its size.
        if request.identity.is_commit_pinned() {
            if let Some(cache) = self.existing_cache(&request.identity).await? {
                debug!(identity = %request.identity, "pinned file already cached; skipping upstream lookup");
                return respond(cache, Some(upstream), &request.identity, request).await;
            }
        }

        let meta = upstream.probe(&request.identity).await?;
        let identity = match &meta.commit {
            Some(commit) => {
                if let Err(err) = self.registry.record_revision(&request.identity, commit) {
                    warn!(identity = %request.identity, error = %err, "unable to record revision");
                }
                request.identity.with_commit(commit.clone())
            }
            None => request.identity.clone(),
        };
        debug!(identity = %identity, size = meta.size, "upstream file resolved");

        if request.method == RequestMethod::Head {
            return match self.existing_cache(&identity).await? {
                Some(cache) => respond(cache, Some(upstream), &identity, request).await,
                None => head_from_upstream_meta(&identity, &meta, request.range.as_deref()),
            };
        }
        let cache = self.registry.open_or_create(&identity, meta.size).await?;
        respond(cache, Some(upstream), &identity, request).await
    }

    /// Cache already on disk for `identity`. Unreadable files count as absent here; the GET
    /// path recreates them.
    async fn existing_cache(&self, identity: &FileIdentity) -> MirrorResult<Option<SharedCache>> {
        match self.registry.open_existing(identity).await {
            Err(err) if err.kind() == MirrorErrorKind::Corrupt => {
                warn!(identity = %identity, error = %err, "ignoring unreadable cache file");
                Ok(None)
            }
            other => other,
        }
    }

    async fn open_offline(&self, request: &FileRequest) -> MirrorResult<Option<FileResponse>> {
        let identity = match self.registry.resolve_revision(&request.identity)? {
            Some(commit) => request.identity.with_commit(commit),
            None => request.identity.clone(),
        };
        let Some(cache) = self.registry.open_existing(&identity).await? else {
            debug!(identity = %identity, "not cached");
            return Ok(None);
        };
        Ok(Some(respond(cache, None, &identity, request).await?))
    }
}

async fn respond(
    cache: SharedCache,
    upstream: Option<&Arc<UpstreamClient>>,
    identity: &FileIdentity,
    request: &FileRequest,
) -> MirrorResult<FileResponse> {
    let fetcher = upstream.map(|client| Arc::clone(client) as Arc<dyn UpstreamFetch>);
    CacheOrchestrator::new(cache, fetcher)
        .respond(identity, request.range.as_deref(), request.method)
        .await
}

/// HEAD answer for a file that has no cache yet, built from the upstream metadata alone so that no cache
/// file is allocated. The upstream entity tag is passed on when it sent one.
fn head_from_upstream_meta(
    identity: &FileIdentity,
    meta: &UpstreamMeta,
    range: Option<&str>,
) -> MirrorResult<FileResponse> {
    let plan = RangePlan::new(range, meta.size)?;
    let etag = meta
        .etag
        .clone()
        .unwrap_or_else(|| etag_value(0, meta.size));
    let commit = (!identity.commit.is_empty()).then_some(identity.commit.as_str());
    Ok(FileResponse {
        status: plan.status,
        headers: plan.headers(&etag, commit),
        body: None,
    })
}

#[async_trait]
impl FileSource for CachedUpstreamSource {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn open(&self, request: &FileRequest) -> MirrorResult<Option<FileResponse>> {
        let Some(upstream) = &self.upstream else {
            return self.open_offline(request).await;
        };
        match self.open_online(upstream, request).await {
            Ok(response) => Ok(Some(response)),
            Err(err) if err.kind() == MirrorErrorKind::Unavailable => {
                info!(identity = %request.identity, error = %err, "upstream unavailable; trying cache only");
                match self.open_offline(request).await? {
                    Some(response) => Ok(Some(response)),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// Sources tried in order; the first one that answers wins.
#[derive(Clone, Default)]
pub struct SourceChain {
    sources: Vec<Arc<dyn FileSource>>,
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: Arc<dyn FileSource>) {
        self.sources.push(source);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    pub async fn open(&self, request: &FileRequest) -> MirrorResult<Option<FileResponse>> {
        for source in &self.sources {
            if let Some(response) = source.open(request).await? {
                debug!(source = source.name(), identity = %request.identity, "source answered");
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::{FileRequest, FileSource, SourceChain, head_from_upstream_meta};
    use async_trait::async_trait;
    use hubmirror_core::{
        FileIdentity, FileResponse, MirrorError, MirrorErrorKind, MirrorResult, RepoType,
        RequestMethod, ResponseStatus,
    };
    use hubmirror_http::UpstreamMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        answer: Option<MirrorErrorKind>,
        hit: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, hit: bool, answer: Option<MirrorErrorKind>) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer,
                hit,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FileSource for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn open(&self, _request: &FileRequest) -> MirrorResult<Option<FileResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = self.answer {
                return Err(MirrorError::new(kind));
            }
            Ok(self.hit.then(|| {
                let mut headers = BTreeMap::new();
                headers.insert("x-source".to_string(), self.name.to_string());
                FileResponse {
                    status: ResponseStatus::Full,
                    headers,
                    body: None,
                }
            }))
        }
    }

    fn request() -> FileRequest {
        FileRequest {
            identity: FileIdentity::new(RepoType::Models, Some("acme".into()), "tiny", "main", "a"),
            range: None,
            method: RequestMethod::Head,
        }
    }

    #[tokio::test]
    async fn first_answering_source_wins() {
        let miss = Fixed::new("miss", false, None);
        let hit = Fixed::new("hit", true, None);
        let never = Fixed::new("never", true, None);
        let mut chain = SourceChain::new();
        chain.push(miss.clone());
        chain.push(hit.clone());
        chain.push(never.clone());
        assert_eq!(chain.names(), vec!["miss", "hit", "never"]);

        let response = chain.open(&request()).await.expect("open").expect("answered");
        assert_eq!(response.header("x-source"), Some("hit"));
        assert_eq!(miss.calls.load(Ordering::SeqCst), 1);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn errors_stop_the_chain() {
        let failing = Fixed::new("failing", false, Some(MirrorErrorKind::InvalidInput));
        let later = Fixed::new("later", true, None);
        let mut chain = SourceChain::new();
        chain.push(failing);
        chain.push(later.clone());
        let err = chain.open(&request()).await.expect_err("error");
        assert_eq!(err.kind(), MirrorErrorKind::InvalidInput);
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_chain_answers_nothing() {
        assert!(SourceChain::new().open(&request()).await.expect("open").is_none());
    }

    #[test]
    fn uncached_heads_come_from_upstream_meta() {
        let identity = request().identity.with_commit("abc");
        let meta = UpstreamMeta {
            size: 1000,
            commit: Some("abc".into()),
            etag: Some("\"upstream\"".into()),
        };
        let full = head_from_upstream_meta(&identity, &meta, None).expect("head");
        assert_eq!(full.status, ResponseStatus::Full);
        assert_eq!(full.header("etag"), Some("\"upstream\""));
        assert_eq!(full.header("content-length"), Some("1000"));
        assert_eq!(full.header("x-repo-commit"), Some("abc"));
        assert!(full.body.is_none());

        let meta = UpstreamMeta { etag: None, ..meta };
        let ranged = head_from_upstream_meta(&identity, &meta, Some("bytes=0-9")).expect("ranged");
        assert_eq!(ranged.status, ResponseStatus::Partial);
        assert_eq!(ranged.header("content-range"), Some("bytes 0-9/1000"));
        assert_eq!(ranged.header("etag"), Some("\"0-1000\""));
    }
}
