//! Stored copies of upstream metadata API answers, served again when the upstream is offline or
//! out of reach.
//!
//! Layout below `root`: `{segments..}/_response.json` for requests without a query, and
//! `{segments..}/_response.{digest}.json` otherwise, where `digest` is the first 8 bytes of the
//! query's sha256 in hex.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use hubmirror_core::{MirrorError, MirrorErrorKind, MirrorResult};
use sha2::{Digest, Sha256};
use tracing::debug;

const RESPONSE_STEM: &str = "_response";
const QUERY_DIGEST_LEN: usize = 8;

#[derive(Clone, Debug)]
pub struct ApiCache {
    root: PathBuf,
}

impl ApiCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the answer for `segments` (the path after `/api/`) and `query` is kept.
    pub fn response_path(&self, segments: &[String], query: Option<&str>) -> MirrorResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in segments.iter().filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." || segment.contains(['/', '\\']) {
                return Err(MirrorError::with_message(
                    MirrorErrorKind::InvalidInput,
                    format!("api path segment '{segment}' cannot be stored"),
                ));
            }
            path.push(segment);
        }
        let file_name = match query.filter(|query| !query.is_empty()) {
            Some(query) => {
                let digest = Sha256::digest(query.as_bytes());
                let hex: String = digest[..QUERY_DIGEST_LEN]
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect();
                format!("{RESPONSE_STEM}.{hex}.json")
            }
            None => format!("{RESPONSE_STEM}.json"),
        };
        path.push(file_name);
        Ok(path)
    }

    /// Replace the stored answer. The body is written to a temporary file first so readers
    /// never observe a partial answer.
    pub async fn store(&self, segments: &[String], query: Option<&str>, body: &[u8]) -> MirrorResult<()> {
        let path = self.response_path(segments, query)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err("create api cache directory"))?;
        }
        let staging = path.with_extension("json.partial");
        tokio::fs::write(&staging, body)
            .await
            .map_err(io_err("write api response"))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(io_err("publish api response"))?;
        debug!(path = %path.display(), bytes = body.len(), "api response stored");
        Ok(())
    }

    pub async fn load(&self, segments: &[String], query: Option<&str>) -> MirrorResult<Option<Bytes>> {
        let path = self.response_path(segments, query)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err("read api response")(err)),
        }
    }
}

fn io_err(context: &'static str) -> impl Fn(std::io::Error) -> MirrorError {
    move |err| {
        let message = format!("{context}: {err}");
        MirrorError::with_message(MirrorError::from(err).kind(), message)
    }
}
