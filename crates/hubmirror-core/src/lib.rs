use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

pub mod bitset;
pub mod range;
pub mod response;

pub use bitset::Bitset;
pub use range::{
    ByteWindow, RangeRequest, RangeSpec, content_range_value, get_all_ranges, parse_range_params,
};
pub use response::{FileResponse, RangePlan, RequestMethod, ResponseStatus, etag_value};

/// Error categories surfaced by the mirror core.
///
/// The kinds are transport-agnostic; the HTTP layer decides how each one maps to a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorErrorKind {
    /// Malformed caller input (range header, block payload length, configuration value).
    InvalidInput,
    /// An index or offset falls outside the addressable range.
    OutOfRange,
    /// A persisted cache file failed validation and must be recreated before use.
    Corrupt,
    /// The cache file is valid but does not hold every block yet.
    Incomplete,
    /// Upstream could not be reached or timed out.
    Unavailable,
    /// The requested repository or file does not exist in any source.
    NotFound,
    /// Local I/O failure.
    Io,
    /// Operation not supported in the current configuration.
    Unsupported,
}

impl fmt::Display for MirrorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidInput => "invalid input",
            Self::OutOfRange => "out of range",
            Self::Corrupt => "corrupt cache",
            Self::Incomplete => "incomplete cache",
            Self::Unavailable => "upstream unavailable",
            Self::NotFound => "not found",
            Self::Io => "i/o error",
            Self::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorError {
    kind: MirrorErrorKind,
    message: Option<String>,
}

impl MirrorError {
    pub fn new(kind: MirrorErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: MirrorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> MirrorErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for MirrorError {}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => MirrorErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => MirrorErrorKind::Unavailable,
            _ => MirrorErrorKind::Io,
        };
        Self::with_message(kind, err.to_string())
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;

/// Lazily produced body bytes. Streams are consumed once, from the start.
pub type ByteStream = BoxStream<'static, MirrorResult<Bytes>>;

/// Repository namespaces understood by the hub URL layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RepoType {
    Models,
    Datasets,
    Spaces,
}

impl RepoType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "models" => Some(Self::Models),
            "datasets" => Some(Self::Datasets),
            "spaces" => Some(Self::Spaces),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Models => "models",
            Self::Datasets => "datasets",
            Self::Spaces => "spaces",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical identity of one remote file: exactly one cache file exists per identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub repo_type: RepoType,
    pub org: Option<String>,
    pub repo: String,
    pub commit: String,
    pub path: String,
}

impl FileIdentity {
    pub fn new(
        repo_type: RepoType,
        org: Option<String>,
        repo: impl Into<String>,
        commit: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repo_type,
            org,
            repo: repo.into(),
            commit: commit.into(),
            path: path.into(),
        }
    }

    /// `org/repo`, or just `repo` for org-less repositories.
    pub fn repo_id(&self) -> String {
        match &self.org {
            Some(org) => format!("{org}/{}", self.repo),
            None => self.repo.clone(),
        }
    }

    /// True when `commit` is a full 40-character commit hash rather than a branch or tag name.
    /// Such an identity always names the same bytes.
    pub fn is_commit_pinned(&self) -> bool {
        self.commit.len() == 40 && self.commit.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    pub fn with_commit(&self, commit: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}:{}",
            self.repo_type,
            self.repo_id(),
            self.commit,
            self.path
        )
    }
}

/// Byte-range fetch capability backed by the remote origin.
///
/// Implementations must map connect and read timeouts to [`MirrorErrorKind::Unavailable`] so
/// callers can tell "try again later" apart from local faults.
#[async_trait]
pub trait UpstreamFetch: Send + Sync {
    /// Fetch `[start, end_exclusive)` of `identity`. The stream yields exactly that many bytes or
    /// ends with an error.
    async fn fetch_range(
        &self,
        identity: &FileIdentity,
        start: u64,
        end_exclusive: u64,
    ) -> MirrorResult<ByteStream>;
}

#[async_trait]
impl<T> UpstreamFetch for Arc<T>
where
    T: UpstreamFetch + ?Sized,
{
    async fn fetch_range(
        &self,
        identity: &FileIdentity,
        start: u64,
        end_exclusive: u64,
    ) -> MirrorResult<ByteStream> {
        (**self).fetch_range(identity, start, end_exclusive).await
    }
}
