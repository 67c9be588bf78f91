//! Client for the upstream hub: file metadata probes, byte-range fetches and pass-through
//! requests for the metadata API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, HeaderMap, RANGE};
use hubmirror_core::{
    ByteStream, FileIdentity, MirrorError, MirrorErrorKind, MirrorResult, RepoType, UpstreamFetch,
};
use reqwest::{Client as ReqwestClient, StatusCode, redirect};
use url::Url;

const FETCH_RANGE_MAX_ATTEMPTS: usize = 3;
const HEADER_REPO_COMMIT: &str = "x-repo-commit";
const HEADER_LINKED_SIZE: &str = "x-linked-size";
const HEADER_LINKED_ETAG: &str = "x-linked-etag";

#[derive(Clone, Copy, Debug)]
pub struct UpstreamOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// What the upstream reports about one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamMeta {
    pub size: u64,
    /// Commit the requested revision resolved to, when the upstream says so.
    pub commit: Option<String>,
    pub etag: Option<String>,
}

/// Buffered response of a pass-through request.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct UpstreamClient {
    inner: ReqwestClient,
    /// Does not follow redirects, so resolve headers on the first hop stay visible.
    meta: ReqwestClient,
    base: Url,
}

impl UpstreamClient {
    pub fn new(base: Url, options: UpstreamOptions) -> MirrorResult<Self> {
        if base.cannot_be_a_base() {
            return Err(MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                format!("upstream url '{base}' cannot be a base"),
            ));
        }
        let inner = ReqwestClient::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .build()
            .map_err(build_err)?;
        let meta = ReqwestClient::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(build_err)?;
        Ok(Self { inner, meta, base })
    }

    /// `{base}/{prefix}{org}/{repo}/resolve/{commit}/{path}`.
    pub fn file_url(&self, identity: &FileIdentity) -> MirrorResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                MirrorError::with_message(MirrorErrorKind::InvalidInput, "invalid upstream url")
            })?;
            segments.pop_if_empty();
            if identity.repo_type != RepoType::Models {
                segments.push(identity.repo_type.as_str());
            }
            if let Some(org) = &identity.org {
                segments.push(org);
            }
            segments.push(&identity.repo);
            segments.push("resolve");
            segments.push(&identity.commit);
            segments.extend(identity.path.split('/'));
        }
        Ok(url)
    }

    /// Resolve size, commit and entity tag of a file.
    pub async fn probe(&self, identity: &FileIdentity) -> MirrorResult<UpstreamMeta> {
        let url = self.file_url(identity)?;
        tracing::debug!(%url, "upstream probe");
        let resp = self
            .meta
            .head(url.as_str())
            .send()
            .await
            .map_err(request_err("probe HEAD"))?;
        let status = resp.status();
        tracing::debug!(status = %status, "upstream probe response");
        check_status(status, identity)?;

        let headers = resp.headers();
        let commit = header_str(headers, HEADER_REPO_COMMIT).map(str::to_string);
        let etag = header_str(headers, HEADER_LINKED_ETAG)
            .or_else(|| header_str(headers, ETAG.as_str()))
            .map(str::to_string);
        let mut size = header_str(headers, HEADER_LINKED_SIZE).and_then(|s| s.parse::<u64>().ok());
        if size.is_none() && status.is_success() {
            size = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|s| s.parse().ok());
        }
        let size = match size {
            Some(size) => size,
            None => self.probe_size(&url).await?,
        };
        Ok(UpstreamMeta { size, commit, etag })
    }

    async fn probe_size(&self, url: &Url) -> MirrorResult<u64> {
        tracing::debug!(%url, "upstream probe range");
        let resp = self
            .inner
            .get(url.as_str())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(request_err("probe GET"))?;
        if let Some(len) = header_str(resp.headers(), CONTENT_RANGE.as_str())
            .and_then(parse_content_range)
            .and_then(|(_, _, total)| total)
        {
            return Ok(len);
        }
        if resp.status().is_success() {
            if let Some(len) =
                header_str(resp.headers(), CONTENT_LENGTH.as_str()).and_then(|s| s.parse().ok())
            {
                return Ok(len);
            }
        }
        Err(MirrorError::with_message(
            MirrorErrorKind::Unavailable,
            "unable to determine upstream content length",
        ))
    }

    /// GET `path_and_query` relative to the base url and buffer the answer.
    pub async fn fetch_raw(&self, path_and_query: &str) -> MirrorResult<RawResponse> {
        let url = self.base.join(path_and_query.trim_start_matches('/')).map_err(|err| {
            MirrorError::with_message(
                MirrorErrorKind::InvalidInput,
                format!("invalid upstream path '{path_and_query}': {err}"),
            )
        })?;
        tracing::debug!(%url, "upstream pass-through");
        let resp = self
            .inner
            .get(url.as_str())
            .send()
            .await
            .map_err(request_err("GET"))?;
        let status = resp.status().as_u16();
        let content_type = header_str(resp.headers(), CONTENT_TYPE.as_str()).map(str::to_string);
        let body = resp.bytes().await.map_err(request_err("read body"))?;
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl UpstreamFetch for UpstreamClient {
    async fn fetch_range(
        &self,
        identity: &FileIdentity,
        start: u64,
        end_exclusive: u64,
    ) -> MirrorResult<ByteStream> {
        if start >= end_exclusive {
            return Ok(futures_util::stream::empty::<MirrorResult<Bytes>>().boxed());
        }
        let url = self.file_url(identity)?;
        let end = end_exclusive - 1;
        let expected_len = end_exclusive - start;
        let header = format!("bytes={start}-{end}");
        let mut last_err =
            MirrorError::with_message(MirrorErrorKind::Unavailable, "range fetch did not run");

        for attempt in 1..=FETCH_RANGE_MAX_ATTEMPTS {
            let resp = match self.inner.get(url.as_str()).header(RANGE, &header).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    last_err = request_err("GET")(err);
                    tracing::warn!(
                        attempt,
                        max_attempts = FETCH_RANGE_MAX_ATTEMPTS,
                        start,
                        end,
                        error = %last_err,
                        "upstream fetch attempt failed before response"
                    );
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(not_found(identity));
            }
            let content_range = header_str(resp.headers(), CONTENT_RANGE.as_str());
            let content_length = header_str(resp.headers(), CONTENT_LENGTH.as_str());
            tracing::trace!(
                attempt,
                status = %status,
                start,
                end,
                content_range = ?content_range,
                content_length = ?content_length,
                "upstream fetch response"
            );

            if let Err(message) =
                validate_range_response(status, content_range, content_length, start, end, expected_len)
            {
                last_err = MirrorError::with_message(MirrorErrorKind::Io, message);
                tracing::warn!(
                    attempt,
                    max_attempts = FETCH_RANGE_MAX_ATTEMPTS,
                    start,
                    end,
                    error = %last_err,
                    "upstream fetch attempt received invalid range response"
                );
                continue;
            }

            return Ok(resp
                .bytes_stream()
                .map_err(request_err("read body"))
                .boxed());
        }

        Err(last_err)
    }
}

fn check_status(status: StatusCode, identity: &FileIdentity) -> MirrorResult<()> {
    match status {
        StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(not_found(identity))
        }
        status if status.is_server_error() => Err(MirrorError::with_message(
            MirrorErrorKind::Unavailable,
            format!("upstream status {status}"),
        )),
        status if status.is_client_error() => Err(MirrorError::with_message(
            MirrorErrorKind::Io,
            format!("upstream status {status}"),
        )),
        _ => Ok(()),
    }
}

fn not_found(identity: &FileIdentity) -> MirrorError {
    MirrorError::with_message(
        MirrorErrorKind::NotFound,
        format!("{identity} not found upstream"),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn validate_range_response(
    status: StatusCode,
    content_range: Option<&str>,
    content_length: Option<&str>,
    expected_start: u64,
    expected_end: u64,
    expected_len: u64,
) -> Result<(), String> {
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(format!(
            "GET status {status} (expected 206 Partial Content)"
        ));
    }

    let content_range =
        content_range.ok_or_else(|| "missing Content-Range on partial response".to_string())?;
    let (start, end, _) = parse_content_range(content_range)
        .ok_or_else(|| format!("invalid Content-Range header '{content_range}'"))?;
    if start != expected_start || end != expected_end {
        return Err(format!(
            "content-range mismatch: got bytes {start}-{end}, expected bytes {expected_start}-{expected_end}"
        ));
    }

    if let Some(content_length) = content_length {
        let parsed_len = content_length
            .parse::<u64>()
            .map_err(|_| format!("invalid Content-Length header '{content_length}'"))?;
        if parsed_len != expected_len {
            return Err(format!(
                "content-length mismatch: got {parsed_len}, expected {expected_len}"
            ));
        }
    }

    Ok(())
}

/// Parse `bytes start-end/total`; `total` is `None` for `*`.
fn parse_content_range(hdr: &str) -> Option<(u64, u64, Option<u64>)> {
    let hdr = hdr.trim().strip_prefix("bytes ")?;
    let (span, total) = hdr.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };
    Some((start, end, total))
}

fn build_err(err: reqwest::Error) -> MirrorError {
    MirrorError::with_message(MirrorErrorKind::Io, format!("build HTTP client: {err}"))
}

fn request_err(op: &'static str) -> impl Fn(reqwest::Error) -> MirrorError {
    move |err| {
        let kind = if err.is_timeout() || err.is_connect() {
            MirrorErrorKind::Unavailable
        } else {
            MirrorErrorKind::Io
        };
        MirrorError::with_message(kind, format!("{op}: {err}"))
    }
}
