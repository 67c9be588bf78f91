//! Serves plain model directories (`root/{org}/{repo}/...`) as if they were hub repositories.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use hubmirror_core::{
    ByteWindow, FileResponse, MirrorError, MirrorErrorKind, MirrorResult, RangePlan,
    RequestMethod, ResponseStatus, etag_value,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use walkdir::WalkDir;

const READ_CHUNK: usize = 64 * 1024;
const PSEUDO_SHA_LEN: usize = 40;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Repository metadata in the shape the hub API returns for `/api/models/{org}/{repo}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    #[serde(rename = "_id")]
    pub internal_id: String,
    pub id: String,
    pub model_id: String,
    pub author: String,
    pub sha: String,
    pub last_modified: String,
    pub private: bool,
    pub gated: bool,
    pub disabled: bool,
    pub tags: Vec<String>,
    pub description: String,
    pub downloads: u64,
    pub likes: u64,
    pub siblings: Vec<Sibling>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Sibling {
    pub rfilename: String,
}

#[derive(Clone, Debug)]
pub struct ModelBinStore {
    root: PathBuf,
}

impl ModelBinStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate `path` inside `{org}/{repo}`. Returns `None` when no such regular file exists.
    ///
    /// Paths that would leave the repository directory are rejected with `InvalidInput`.
    pub fn file_path(&self, org: Option<&str>, repo: &str, path: &str) -> MirrorResult<Option<PathBuf>> {
        let repo_dir = self.repo_dir(org, repo)?;
        let relative = Path::new(path.trim_start_matches(['/', '\\']));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(traversal(path));
        }
        let candidate = repo_dir.join(relative);
        if !candidate.is_file() {
            return Ok(None);
        }

        // Symlinks may still point outside the store.
        let (Ok(root), Ok(resolved)) = (self.root.canonicalize(), candidate.canonicalize()) else {
            return Ok(None);
        };
        if !resolved.starts_with(&root) {
            return Err(traversal(path));
        }
        Ok(Some(resolved))
    }

    fn repo_dir(&self, org: Option<&str>, repo: &str) -> MirrorResult<PathBuf> {
        let mut dir = self.root.clone();
        for segment in org.into_iter().chain(Some(repo)) {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains(['/', '\\'])
            {
                return Err(traversal(segment));
            }
            dir.push(segment);
        }
        Ok(dir)
    }

    /// Hub-style metadata for `{org}/{repo}`, or `None` when the directory does not exist.
    pub fn metadata(&self, org: &str, repo: &str, revision: &str) -> MirrorResult<Option<ModelMetadata>> {
        let repo_dir = self.repo_dir(Some(org), repo)?;
        if !repo_dir.is_dir() {
            return Ok(None);
        }

        let mut siblings = Vec::new();
        for entry in WalkDir::new(&repo_dir).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                MirrorError::with_message(
                    MirrorErrorKind::Io,
                    format!("walk {}: {err}", repo_dir.display()),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&repo_dir) {
                let rfilename = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                siblings.push(Sibling { rfilename });
            }
        }

        let model_id = format!("{org}/{repo}");
        let sha = if revision == "main" {
            pseudo_sha(&model_id)
        } else {
            revision.to_string()
        };
        let modified: DateTime<Utc> = std::fs::metadata(&repo_dir)
            .and_then(|meta| meta.modified())
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let last_modified = modified.format(TIMESTAMP_FORMAT).to_string();
        debug!(model = %model_id, files = siblings.len(), "model-bin metadata");

        Ok(Some(ModelMetadata {
            internal_id: hex_sha256(&format!("{model_id}/{sha}")),
            id: model_id.clone(),
            model_id,
            author: org.to_string(),
            sha,
            last_modified: last_modified.clone(),
            private: false,
            gated: false,
            disabled: false,
            tags: vec!["model-bin".to_string()],
            description: "Local model served via model-bin mode".to_string(),
            downloads: 0,
            likes: 0,
            siblings,
            created_at: last_modified,
        }))
    }
}

/// Stable stand-in commit for a directory that has no history.
pub fn pseudo_sha(model_id: &str) -> String {
    let mut sha = hex_sha256(model_id);
    sha.truncate(PSEUDO_SHA_LEN);
    sha
}

fn hex_sha256(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Range response read straight from `path`.
pub async fn open_file_response(
    path: &Path,
    range_header: Option<&str>,
    method: RequestMethod,
    commit: Option<&str>,
) -> MirrorResult<FileResponse> {
    let meta = tokio::fs::metadata(path).await?;
    let file_size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let plan = RangePlan::new(range_header, file_size)?;
    let headers = plan.headers(&etag_value(mtime, file_size), commit);

    if plan.status == ResponseStatus::Unsatisfiable || method == RequestMethod::Head {
        return Ok(FileResponse {
            status: plan.status,
            headers,
            body: None,
        });
    }

    let file = File::open(path).await?;
    let state = FileReadState {
        file,
        windows: plan.windows.into_iter().rev().collect(),
        current: None,
    };
    let body = stream::try_unfold(state, FileReadState::next_chunk).boxed();
    Ok(FileResponse {
        status: plan.status,
        headers,
        body: Some(body),
    })
}

struct FileReadState {
    file: File,
    /// Remaining windows, last one first.
    windows: Vec<ByteWindow>,
    current: Option<ByteWindow>,
}

impl FileReadState {
    async fn next_chunk(mut self) -> MirrorResult<Option<(Bytes, Self)>> {
        let window = loop {
            match self.current.take() {
                Some(window) if !window.is_empty() => break window,
                _ => match self.windows.pop() {
                    Some(window) => {
                        self.file.seek(SeekFrom::Start(window.start)).await?;
                        self.current = Some(window);
                    }
                    None => return Ok(None),
                },
            }
        };

        let want = window.len().min(READ_CHUNK as u64) as usize;
        let mut buf = vec![0u8; want];
        let read = self.file.read(&mut buf).await?;
        if read == 0 {
            return Err(MirrorError::with_message(
                MirrorErrorKind::Io,
                "model-bin file shrank while streaming",
            ));
        }
        buf.truncate(read);
        self.current = Some(ByteWindow::new(window.start + read as u64, window.end));
        Ok(Some((Bytes::from(buf), self)))
    }
}

fn traversal(path: &str) -> MirrorError {
    MirrorError::with_message(
        MirrorErrorKind::InvalidInput,
        format!("path '{path}' escapes the model-bin root"),
    )
}
