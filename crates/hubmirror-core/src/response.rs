//! Typed file responses handed from sources to the HTTP layer.

use std::collections::BTreeMap;
use std::fmt;

use crate::range::{ByteWindow, RangeRequest, content_range_value};
use crate::{ByteStream, MirrorResult};

pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_RANGE: &str = "content-range";
pub const HEADER_ETAG: &str = "etag";
pub const HEADER_ACCEPT_RANGES: &str = "accept-ranges";
pub const HEADER_REPO_COMMIT: &str = "x-repo-commit";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// Outcome class of a file response. The HTTP layer maps these to 200, 206 and 416.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Full,
    Partial,
    Unsatisfiable,
}

/// Headers plus a lazily produced body. `body` is `None` for HEAD requests and for
/// unsatisfiable ranges.
pub struct FileResponse {
    pub status: ResponseStatus,
    pub headers: BTreeMap<String, String>,
    pub body: Option<ByteStream>,
}

impl FileResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl fmt::Debug for FileResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

/// Windows and header values derived from an optional `Range` header and a known file size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangePlan {
    pub status: ResponseStatus,
    pub windows: Vec<ByteWindow>,
    pub content_length: u64,
    pub content_range: String,
}

impl RangePlan {
    pub fn new(range_header: Option<&str>, file_size: u64) -> MirrorResult<Self> {
        let (request, ranged) = match range_header {
            Some(header) => (RangeRequest::parse(header)?, true),
            None => (RangeRequest::full(file_size), false),
        };
        let windows = request.resolve(file_size)?;
        let status = if !ranged {
            ResponseStatus::Full
        } else if windows.is_empty() {
            ResponseStatus::Unsatisfiable
        } else {
            ResponseStatus::Partial
        };
        let content_length = windows.iter().map(ByteWindow::len).sum();
        let content_range = content_range_value(&windows, request.suffix, file_size);
        Ok(Self {
            status,
            windows,
            content_length,
            content_range,
        })
    }

    pub fn headers(&self, etag: &str, commit: Option<&str>) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(
            HEADER_CONTENT_LENGTH.to_string(),
            self.content_length.to_string(),
        );
        headers.insert(HEADER_CONTENT_RANGE.to_string(), self.content_range.clone());
        headers.insert(HEADER_ETAG.to_string(), etag.to_string());
        headers.insert(HEADER_ACCEPT_RANGES.to_string(), "bytes".to_string());
        if let Some(commit) = commit {
            headers.insert(HEADER_REPO_COMMIT.to_string(), commit.to_string());
        }
        headers
    }
}

/// Strong entity tag built from a timestamp and a size.
pub fn etag_value(unix_secs: u64, file_size: u64) -> String {
    format!("\"{unix_secs}-{file_size}\"")
}
