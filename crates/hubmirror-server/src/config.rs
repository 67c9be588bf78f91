use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hubmirror_core::{MirrorError, MirrorErrorKind, MirrorResult};
use hubmirror_http::UpstreamOptions;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Mirror settings, read from YAML. Every key is optional.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MirrorConfig {
    pub host: String,
    pub port: u16,
    /// Root of the on-disk cache (`files/` and `refs/` live below it).
    pub repos_path: PathBuf,
    pub upstream_url: String,
    /// Never contact the upstream; serve only what is cached or in model-bin.
    pub offline: bool,
    pub block_size: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub model_bin: ModelBinConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ModelBinConfig {
    pub enable: bool,
    pub path: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8090,
            repos_path: PathBuf::from("./repos"),
            upstream_url: "https://huggingface.co".to_string(),
            offline: false,
            block_size: DEFAULT_BLOCK_SIZE,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            model_bin: ModelBinConfig::default(),
        }
    }
}

impl MirrorConfig {
    pub fn load(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            let message = format!("read config {}: {err}", path.display());
            MirrorError::with_message(MirrorError::from(err).kind(), message)
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> MirrorResult<Self> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text).map_err(|err| {
                MirrorError::with_message(MirrorErrorKind::InvalidInput, format!("parse config: {err}"))
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MirrorResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(invalid(format!(
                "block-size must be a non-zero power of two, got {}",
                self.block_size
            )));
        }
        self.upstream_url()?;
        if self.model_bin.enable && self.model_bin.path.is_none() {
            return Err(invalid("model-bin.path is required when model-bin.enable is set"));
        }
        Ok(())
    }

    pub fn upstream_url(&self) -> MirrorResult<Url> {
        Url::parse(&self.upstream_url)
            .map_err(|err| invalid(format!("invalid upstream-url '{}': {err}", self.upstream_url)))
    }

    pub fn upstream_options(&self) -> UpstreamOptions {
        UpstreamOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Model-bin root when the feature is enabled.
    pub fn model_bin_root(&self) -> Option<&Path> {
        if self.model_bin.enable {
            self.model_bin.path.as_deref()
        } else {
            None
        }
    }
}

fn invalid(message: impl Into<String>) -> MirrorError {
    MirrorError::with_message(MirrorErrorKind::InvalidInput, message)
}
