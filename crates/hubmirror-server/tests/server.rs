use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use hubmirror_server::{AppContext, MirrorConfig, ModelBinConfig, serve_listener};

const FILE_PATH: &str = "/acme/tiny/resolve/main/model.bin";
const COMMIT: &str = "89abcdef0123456789abcdef0123456789abcdef";
const FILE_LEN: usize = 300_000;
const BLOCK_SIZE: u64 = 64 * 1024;

struct Upstream {
    data: Vec<u8>,
    range_gets: AtomicUsize,
    heads: AtomicUsize,
}

impl Upstream {
    fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            range_gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
        })
    }
}

struct Running {
    base: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn data_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn start_upstream(state: Arc<Upstream>) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _)) = accept else { break };
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| upstream_handler(req, Arc::clone(&state)));
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        }
    });
    Running {
        base: format!("http://{addr}"),
        shutdown: Some(shutdown_tx),
    }
}

async fn upstream_handler(
    req: Request<Incoming>,
    state: Arc<Upstream>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    match req.uri().path() {
        "/api/models/acme/tiny" => {
            *resp.body_mut() = Full::new(Bytes::from(format!(
                "{{\"id\":\"acme/tiny\",\"sha\":\"{COMMIT}\"}}"
            )));
            resp.headers_mut()
                .insert(CONTENT_TYPE, "application/json".parse().unwrap());
        }
        path if path.starts_with("/acme/tiny/resolve/") && path.ends_with("/model.bin") => {
            if req.method() == Method::HEAD {
                state.heads.fetch_add(1, Ordering::SeqCst);
            }
            let total = state.data.len();
            let headers = resp.headers_mut();
            headers.insert("x-repo-commit", COMMIT.parse().unwrap());
            headers.insert("x-linked-size", total.into());
            let range = req
                .headers()
                .get(RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_range);
            match (req.method(), range) {
                (&Method::GET, Some((start, end))) => {
                    state.range_gets.fetch_add(1, Ordering::SeqCst);
                    let end = end.min(total - 1);
                    headers.insert(CONTENT_LENGTH, (end + 1 - start).into());
                    headers.insert(
                        CONTENT_RANGE,
                        format!("bytes {start}-{end}/{total}").parse().unwrap(),
                    );
                    *resp.status_mut() = StatusCode::PARTIAL_CONTENT;
                    *resp.body_mut() =
                        Full::new(Bytes::copy_from_slice(&state.data[start..=end]));
                }
                _ => {
                    headers.insert(CONTENT_LENGTH, total.into());
                    if req.method() == Method::GET {
                        *resp.body_mut() = Full::new(Bytes::copy_from_slice(&state.data));
                    }
                }
            }
        }
        _ => *resp.status_mut() = StatusCode::NOT_FOUND,
    }
    Ok(resp)
}

fn parse_range(header: &str) -> Option<(usize, usize)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn config(repos: &Path, upstream_url: &str) -> MirrorConfig {
    MirrorConfig {
        host: "127.0.0.1".into(),
        port: 0,
        repos_path: repos.to_path_buf(),
        upstream_url: upstream_url.into(),
        block_size: BLOCK_SIZE,
        connect_timeout_secs: 1,
        read_timeout_secs: 5,
        ..MirrorConfig::default()
    }
}

async fn start_mirror(config: MirrorConfig) -> Running {
    let ctx = Arc::new(AppContext::new(config).expect("context"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mirror");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve_listener(listener, ctx, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });
    Running {
        base: format!("http://{addr}"),
        shutdown: Some(shutdown_tx),
    }
}

async fn get(base: &str, path: &str, range: Option<&str>) -> reqwest::Response {
    let mut req = reqwest::Client::new().get(format!("{base}{path}"));
    if let Some(range) = range {
        req = req.header(RANGE, range);
    }
    req.send().await.expect("send")
}

fn cache_file(repos: &Path) -> std::path::PathBuf {
    repos
        .join("files/models/acme/tiny/resolve")
        .join(COMMIT)
        .join("model.bin")
}

fn header<'a>(resp: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn range_reads_fill_the_cache_once() {
    let repos = tempfile::tempdir().expect("repos");
    let data = data_blob(FILE_LEN);
    let upstream_state = Upstream::new(data.clone());
    let upstream = start_upstream(Arc::clone(&upstream_state)).await;
    let mirror = start_mirror(config(repos.path(), &upstream.base)).await;

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=70000-140000")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes 70000-140000/300000"));
    assert_eq!(header(&resp, "x-repo-commit"), Some(COMMIT));
    let etag = header(&resp, "etag").expect("etag").to_string();
    assert!(etag.ends_with("-300000\""));
    assert_eq!(resp.bytes().await.expect("body"), &data[70000..140001]);
    assert_eq!(upstream_state.range_gets.load(Ordering::SeqCst), 1);

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=65536-131071")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "etag"), Some(etag.as_str()));
    assert_eq!(resp.bytes().await.expect("body"), &data[65536..131072]);
    assert_eq!(upstream_state.range_gets.load(Ordering::SeqCst), 1);

    let resp = get(&mirror.base, FILE_PATH, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "content-length"), Some("300000"));
    assert_eq!(resp.bytes().await.expect("body"), data);

    assert!(cache_file(repos.path()).is_file());
    assert_eq!(
        std::fs::read_to_string(repos.path().join("refs/models/acme/tiny/main")).expect("ref"),
        COMMIT
    );
}

#[tokio::test]
async fn head_unsatisfiable_and_method_checks() {
    let repos = tempfile::tempdir().expect("repos");
    let upstream_state = Upstream::new(data_blob(FILE_LEN));
    let upstream = start_upstream(Arc::clone(&upstream_state)).await;
    let mirror = start_mirror(config(repos.path(), &upstream.base)).await;
    let client = reqwest::Client::new();

    let resp = client
        .head(format!("{}{FILE_PATH}", mirror.base))
        .send()
        .await
        .expect("head");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "accept-ranges"), Some("bytes"));
    assert_eq!(header(&resp, "x-repo-commit"), Some(COMMIT));
    assert!(header(&resp, "etag").is_some());
    assert_eq!(upstream_state.range_gets.load(Ordering::SeqCst), 0);
    assert!(!cache_file(repos.path()).exists());

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=400000-")).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&resp, "content-range"), Some("bytes */300000"));

    let resp = get(&mirror.base, FILE_PATH, Some("items=0-10")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{}{FILE_PATH}", mirror.base))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(header(&resp, "allow"), Some("GET, HEAD"));

    let resp = get(&mirror.base, "/acme/tiny/resolve/main/missing.bin", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = get(&mirror.base, "/acme/tiny/blob/main/model.bin", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = get(&mirror.base, "/api/models/acme/tiny", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "content-type"), Some("application/json"));
    assert!(resp.text().await.expect("text").contains(COMMIT));
}

#[tokio::test]
async fn offline_serves_only_cached_blocks() {
    let repos = tempfile::tempdir().expect("repos");
    let data = data_blob(FILE_LEN);
    let upstream_state = Upstream::new(data.clone());
    {
        let upstream = start_upstream(Arc::clone(&upstream_state)).await;
        let online = start_mirror(config(repos.path(), &upstream.base)).await;
        let resp = get(&online.base, FILE_PATH, Some("bytes=0-65535")).await;
        assert_eq!(resp.bytes().await.expect("warm"), &data[..65536]);
        let resp = get(&online.base, "/api/models/acme/tiny", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let mut offline_config = config(repos.path(), "http://127.0.0.1:9");
    offline_config.offline = true;
    let mirror = start_mirror(offline_config).await;

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=100-199")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "x-repo-commit"), Some(COMMIT));
    assert_eq!(resp.bytes().await.expect("body"), &data[100..200]);

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=200000-200099")).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

    let resp = get(&mirror.base, "/acme/tiny/resolve/main/other.bin", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = get(&mirror.base, "/api/models/acme/tiny", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "content-type"), Some("application/json"));
    assert!(resp.text().await.expect("text").contains(COMMIT));

    let resp = get(&mirror.base, "/api/models/acme/other", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_upstream_falls_back_to_cache() {
    let repos = tempfile::tempdir().expect("repos");
    let data = data_blob(FILE_LEN);
    let upstream_state = Upstream::new(data.clone());
    {
        let upstream = start_upstream(Arc::clone(&upstream_state)).await;
        let online = start_mirror(config(repos.path(), &upstream.base)).await;
        let resp = get(&online.base, FILE_PATH, Some("bytes=-1000")).await;
        assert_eq!(resp.bytes().await.expect("warm"), &data[FILE_LEN - 1000..]);
        let resp = get(&online.base, "/api/models/acme/tiny", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead = format!("http://{}", closed.local_addr().expect("addr"));
    drop(closed);
    let mirror = start_mirror(config(repos.path(), &dead)).await;

    let resp = get(&mirror.base, FILE_PATH, Some("bytes=-500")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes -500/300000"));
    assert_eq!(resp.bytes().await.expect("body"), &data[FILE_LEN - 500..]);

    let resp = get(&mirror.base, "/acme/tiny/resolve/main/never-cached.bin", None).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

    let resp = get(&mirror.base, "/api/models/acme/tiny", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.text().await.expect("text").contains(COMMIT));
    let resp = get(&mirror.base, "/api/models/acme/unknown", None).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn pinned_cached_files_skip_the_upstream_lookup() {
    let repos = tempfile::tempdir().expect("repos");
    let data = data_blob(FILE_LEN);
    let upstream_state = Upstream::new(data.clone());
    let upstream = start_upstream(Arc::clone(&upstream_state)).await;
    let mirror = start_mirror(config(repos.path(), &upstream.base)).await;
    let pinned = format!("/acme/tiny/resolve/{COMMIT}/model.bin");

    let resp = get(&mirror.base, &pinned, Some("bytes=0-99")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.bytes().await.expect("body"), &data[..100]);
    assert_eq!(upstream_state.heads.load(Ordering::SeqCst), 1);

    let resp = get(&mirror.base, &pinned, Some("bytes=200000-200099")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "x-repo-commit"), Some(COMMIT));
    assert_eq!(resp.bytes().await.expect("body"), &data[200000..200100]);
    assert_eq!(upstream_state.heads.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_state.range_gets.load(Ordering::SeqCst), 2);

    // Branch names still resolve through the upstream every time.
    let resp = get(&mirror.base, FILE_PATH, Some("bytes=0-99")).await;
    assert_eq!(resp.bytes().await.expect("body"), &data[..100]);
    assert_eq!(upstream_state.heads.load(Ordering::SeqCst), 2);
    assert_eq!(upstream_state.range_gets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn model_bin_files_and_metadata_are_served_locally() {
    let repos = tempfile::tempdir().expect("repos");
    let models = tempfile::tempdir().expect("models");
    let repo = models.path().join("acme").join("local");
    std::fs::create_dir_all(&repo).expect("mkdir");
    let weights = data_blob(5000);
    std::fs::write(repo.join("weights.bin"), &weights).expect("weights");
    std::fs::write(models.path().join("secret.txt"), b"secret").expect("secret");

    let mut mirror_config = config(repos.path(), "http://127.0.0.1:9");
    mirror_config.offline = true;
    mirror_config.model_bin = ModelBinConfig {
        enable: true,
        path: Some(models.path().to_path_buf()),
    };
    let mirror = start_mirror(mirror_config).await;

    let resp = get(&mirror.base, "/acme/local/resolve/main/weights.bin", Some("bytes=10-19")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), Some("bytes 10-19/5000"));
    assert_eq!(resp.bytes().await.expect("body"), &weights[10..20]);

    let resp = get(
        &mirror.base,
        "/acme/local/resolve/main/%2E%2E%2F%2E%2E%2Fsecret.txt",
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = get(&mirror.base, "/api/models/acme/local", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let meta: serde_json::Value =
        serde_json::from_str(&resp.text().await.expect("text")).expect("json");
    assert_eq!(meta["id"], "acme/local");
    assert_eq!(meta["siblings"][0]["rfilename"], "weights.bin");
    assert_eq!(meta["sha"].as_str().map(str::len), Some(40));
}
