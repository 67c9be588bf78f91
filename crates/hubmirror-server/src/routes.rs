//! Request path classification.
//!
//! File routes, most specific first:
//! - `/{repo_type}/{org}/{repo}/resolve/{commit}/{path..}`
//! - `/{org_or_repo_type}/{repo}/resolve/{commit}/{path..}`
//! - `/{repo}/resolve/{commit}/{path..}`
//!
//! Anything under `/api/` is a metadata route.

use hubmirror_core::{FileIdentity, MirrorError, MirrorErrorKind, MirrorResult, RepoType};
use percent_encoding::percent_decode_str;

const RESOLVE: &str = "resolve";
const DEFAULT_REVISION: &str = "main";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    File(FileIdentity),
    Api(ApiRoute),
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiRoute {
    /// Request path plus query, forwarded verbatim to the upstream.
    pub path_and_query: String,
    /// Decoded path segments after `api`.
    pub segments: Vec<String>,
    pub query: Option<String>,
    /// Set for `/api/models/{org}/{repo}[/revision/{rev}]`, which model-bin can answer locally.
    pub model_meta: Option<ModelMetaRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelMetaRequest {
    pub org: String,
    pub repo: String,
    pub revision: String,
}

pub fn parse_route(path: &str, query: Option<&str>) -> MirrorResult<Route> {
    let raw: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if raw.first() == Some(&"api") {
        let path_and_query = match query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
        let mut segments = decode_segments(&raw)?;
        segments.remove(0);
        return Ok(Route::Api(ApiRoute {
            path_and_query,
            model_meta: model_meta_request(&segments),
            segments,
            query: query.map(str::to_string),
        }));
    }

    let segments = decode_segments(&raw)?;
    Ok(parse_file_route(&segments).map_or(Route::NotFound, Route::File))
}

fn parse_file_route(segments: &[String]) -> Option<FileIdentity> {
    let resolve_at = |index: usize| {
        segments.get(index).map(String::as_str) == Some(RESOLVE) && segments.len() > index + 2
    };

    if resolve_at(3) {
        let repo_type = RepoType::parse(&segments[0])?;
        return Some(file_identity(
            repo_type,
            Some(segments[1].clone()),
            &segments[2],
            &segments[4..],
        ));
    }
    if resolve_at(2) {
        return Some(match RepoType::parse(&segments[0]) {
            Some(repo_type) => file_identity(repo_type, None, &segments[1], &segments[3..]),
            None => file_identity(
                RepoType::Models,
                Some(segments[0].clone()),
                &segments[1],
                &segments[3..],
            ),
        });
    }
    if resolve_at(1) {
        return Some(file_identity(RepoType::Models, None, &segments[0], &segments[2..]));
    }
    None
}

/// `rest` is `[commit, path..]`.
fn file_identity(
    repo_type: RepoType,
    org: Option<String>,
    repo: &str,
    rest: &[String],
) -> FileIdentity {
    FileIdentity::new(repo_type, org, repo, rest[0].as_str(), rest[1..].join("/"))
}

/// `segments` excludes the leading `api`.
fn model_meta_request(segments: &[String]) -> Option<ModelMetaRequest> {
    let (kind, org, repo, revision) = match segments {
        [kind, org, repo] => (kind, org, repo, DEFAULT_REVISION),
        [kind, org, repo, marker, revision] if marker == "revision" => {
            (kind, org, repo, revision.as_str())
        }
        _ => return None,
    };
    if kind != "models" || org.is_empty() || repo.is_empty() || revision.is_empty() {
        return None;
    }
    Some(ModelMetaRequest {
        org: org.clone(),
        repo: repo.clone(),
        revision: revision.to_string(),
    })
}

fn decode_segments(raw: &[&str]) -> MirrorResult<Vec<String>> {
    raw.iter()
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|_| {
                    MirrorError::with_message(
                        MirrorErrorKind::InvalidInput,
                        format!("path segment '{segment}' is not valid utf-8"),
                    )
                })
        })
        .collect()
}
