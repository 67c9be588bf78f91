//! hyper HTTP/1 front end.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{ALLOW, CONTENT_TYPE, HeaderName, HeaderValue, RANGE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hubmirror_core::{
    ByteStream, FileResponse, MirrorError, MirrorErrorKind, MirrorResult, RequestMethod,
    ResponseStatus,
};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::routes::{ApiRoute, Route, parse_route};
use crate::sources::FileRequest;
use crate::status_for;

pub type ResponseBody = UnsyncBoxBody<Bytes, MirrorError>;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Bind the configured address and serve until ctrl-c.
pub async fn serve(ctx: Arc<AppContext>) -> MirrorResult<()> {
    let addr = ctx.config.bind_addr();
    let listener = TcpListener::bind(&addr).await.map_err(|err| {
        let message = format!("bind {addr}: {err}");
        MirrorError::with_message(MirrorError::from(err).kind(), message)
    })?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    serve_listener(listener, ctx, shutdown).await
}

/// Accept connections on `listener` until `shutdown` resolves. Each connection runs on its own
/// task.
pub async fn serve_listener(
    listener: TcpListener,
    ctx: Arc<AppContext>,
    shutdown: impl Future<Output = ()>,
) -> MirrorResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mirror listening");
    }
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle(req, Arc::clone(&ctx)));
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    ctx: Arc<AppContext>,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = match *req.method() {
        Method::GET => RequestMethod::Get,
        Method::HEAD => RequestMethod::Head,
        _ => {
            let mut resp = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            resp.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return Ok(resp);
        }
    };
    let path = req.uri().path().to_string();
    let range = req
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    debug!(method = %req.method(), %path, range = ?range, "request");

    let result = match parse_route(&path, req.uri().query()) {
        Ok(Route::File(identity)) => {
            let request = FileRequest {
                identity,
                range,
                method,
            };
            match ctx.sources.open(&request).await {
                Ok(Some(response)) => Ok(file_response(response)),
                Ok(None) => Err(MirrorError::with_message(
                    MirrorErrorKind::NotFound,
                    format!("{} not found", request.identity),
                )),
                Err(err) => Err(err),
            }
        }
        Ok(Route::Api(api)) => api_response(&ctx, &api, method).await,
        Ok(Route::NotFound) => Err(MirrorError::new(MirrorErrorKind::NotFound)),
        Err(err) => Err(err),
    };

    Ok(result.unwrap_or_else(|err| {
        let status = status_for(err.kind());
        if status.is_server_error() {
            warn!(%path, error = %err, "request failed");
        } else {
            debug!(%path, error = %err, "request rejected");
        }
        text(status, &err.to_string())
    }))
}

fn file_response(response: FileResponse) -> Response<ResponseBody> {
    let status = match response.status {
        ResponseStatus::Full => StatusCode::OK,
        ResponseStatus::Partial => StatusCode::PARTIAL_CONTENT,
        ResponseStatus::Unsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
    };
    let body = match response.body {
        Some(stream) => stream_body(stream),
        None => empty_body(),
    };
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "dropping unrepresentable response header"),
        }
    }
    resp
}

async fn api_response(
    ctx: &AppContext,
    api: &ApiRoute,
    method: RequestMethod,
) -> MirrorResult<Response<ResponseBody>> {
    if let (Some(meta), Some(store)) = (&api.model_meta, &ctx.model_bin) {
        if let Some(metadata) = store.metadata(&meta.org, &meta.repo, &meta.revision)? {
            let body = serde_json::to_vec(&metadata).map_err(|err| {
                MirrorError::with_message(MirrorErrorKind::Io, format!("encode metadata: {err}"))
            })?;
            return Ok(buffered(StatusCode::OK, JSON_CONTENT_TYPE, body.into(), method));
        }
    }

    let Some(upstream) = &ctx.upstream else {
        return stored_api_response(ctx, api, method).await?.ok_or_else(|| {
            MirrorError::with_message(
                MirrorErrorKind::NotFound,
                format!("{} is not stored and upstream is offline", api.path_and_query),
            )
        });
    };
    let raw = match upstream.fetch_raw(&api.path_and_query).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == MirrorErrorKind::Unavailable => {
            info!(path = %api.path_and_query, error = %err, "upstream unavailable; trying stored api response");
            return stored_api_response(ctx, api, method).await?.ok_or(err);
        }
        Err(err) => return Err(err),
    };

    let content_type = raw.content_type.as_deref().unwrap_or("application/octet-stream");
    if raw.status == StatusCode::OK.as_u16() && is_json(content_type) {
        if let Err(err) = ctx
            .api_cache
            .store(&api.segments, api.query.as_deref(), &raw.body)
            .await
        {
            warn!(path = %api.path_and_query, error = %err, "unable to store api response");
        }
    }
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok(buffered(status, content_type, raw.body, method))
}

/// Last stored successful answer for `api`, if any.
async fn stored_api_response(
    ctx: &AppContext,
    api: &ApiRoute,
    method: RequestMethod,
) -> MirrorResult<Option<Response<ResponseBody>>> {
    let Some(body) = ctx
        .api_cache
        .load(&api.segments, api.query.as_deref())
        .await?
    else {
        return Ok(None);
    };
    debug!(path = %api.path_and_query, "serving stored api response");
    Ok(Some(buffered(StatusCode::OK, JSON_CONTENT_TYPE, body, method)))
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

fn buffered(
    status: StatusCode,
    content_type: &str,
    body: Bytes,
    method: RequestMethod,
) -> Response<ResponseBody> {
    let len = body.len();
    let body: ResponseBody = match method {
        RequestMethod::Get => Full::new(body).map_err(|never| match never {}).boxed_unsync(),
        RequestMethod::Head => empty_body(),
    };
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

fn text(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(format!("{message}\n")))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn stream_body(stream: ByteStream) -> ResponseBody {
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}
