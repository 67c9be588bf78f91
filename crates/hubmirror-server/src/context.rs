use std::sync::Arc;

use hubmirror_cache_store_std::CacheRegistry;
use hubmirror_core::MirrorResult;
use hubmirror_http::UpstreamClient;
use tracing::info;

use crate::api_cache::ApiCache;
use crate::config::MirrorConfig;
use crate::model_bin::ModelBinStore;
use crate::sources::{CachedUpstreamSource, ModelBinSource, SourceChain};

/// Everything a request handler needs, built once at startup.
pub struct AppContext {
    pub config: MirrorConfig,
    pub registry: Arc<CacheRegistry>,
    /// `None` when running offline.
    pub upstream: Option<Arc<UpstreamClient>>,
    pub model_bin: Option<ModelBinStore>,
    pub api_cache: ApiCache,
    pub sources: SourceChain,
}

impl AppContext {
    pub fn new(config: MirrorConfig) -> MirrorResult<Self> {
        config.validate()?;
        let registry = Arc::new(CacheRegistry::new(&config.repos_path, config.block_size));
        let api_cache = ApiCache::new(config.repos_path.join("api"));
        let upstream = if config.offline {
            None
        } else {
            Some(Arc::new(UpstreamClient::new(
                config.upstream_url()?,
                config.upstream_options(),
            )?))
        };

        let mut sources = SourceChain::new();
        let model_bin = config.model_bin_root().map(|root| {
            let source = Arc::new(ModelBinSource::new(root));
            sources.push(source.clone());
            source.store().clone()
        });
        sources.push(Arc::new(CachedUpstreamSource::new(
            registry.clone(),
            upstream.clone(),
        )));

        info!(
            repos_path = %config.repos_path.display(),
            offline = config.offline,
            block_size = config.block_size,
            sources = ?sources.names(),
            "mirror context ready"
        );
        Ok(Self {
            config,
            registry,
            upstream,
            model_bin,
            api_cache,
            sources,
        })
    }
}
