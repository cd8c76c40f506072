//! Purpose: HTTP surface for uploading step logs and artifacts and reading them back.
//! Exports: `ServeConfig`, `serve`.
//! Role: Thin axum layer over `LogStore`; all storage semantics live in the library.
//! Invariants: Error kinds map to stable status codes and one JSON error envelope.
//! Invariants: Response bodies are streamed; nothing reads a whole log into memory.
//! Notes: Tail metadata travels in `x-pipelog-*` headers, exposed to browsers via CORS.

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipelog::api::{
    AppendOptions, ByteStream, DataChunk, Encoded, Error, ErrorKind, LineMarkup, LineQuery,
    LineWindow, LogStore, ReadOptions, StoreOptions,
};
use pipelog::storage_paths;

const LINES_HEADER: &str = "x-pipelog-lines";
const REMAINING_HEADER: &str = "x-pipelog-remaining";
const POSITION_HEADER: &str = "x-pipelog-position";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub storage_dir: PathBuf,
    pub appender_threads: usize,
    pub queue_capacity: usize,
    pub read_chunk_size: usize,
    pub append_timeout_ms: u64,
    pub max_body_bytes: u64,
}

impl ServeConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            append: AppendOptions {
                shards: self.appender_threads,
                queue_capacity: self.queue_capacity,
                task_timeout: Duration::from_millis(self.append_timeout_ms),
            },
            read: ReadOptions {
                chunk_size: self.read_chunk_size,
                ..ReadOptions::default()
            },
        }
    }
}

struct AppState {
    store: LogStore,
    max_body_bytes: usize,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let store = LogStore::open(&config.storage_dir, config.store_options())?;
    let state = Arc::new(AppState {
        store,
        max_body_bytes,
    });
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, storage = %config.storage_dir.display(), "pipelog listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            info!("shutdown requested");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };
    state.store.shutdown().await;
    result
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(LINES_HEADER),
            HeaderName::from_static(REMAINING_HEADER),
            HeaderName::from_static(POSITION_HEADER),
        ]);
    Router::new()
        .route("/output/:pipeline_id/:step_id", put(append_output))
        .route("/artifacts/:pipeline_id/*path", put(append_artifact))
        .route("/api/:pipeline_id/output/:step_id", get(get_output))
        .route("/api/:pipeline_id/artifacts/*path", get(get_artifact))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.appender_threads == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--appender-threads must be greater than zero")
            .with_hint("Use a small positive value like 2."));
    }
    if config.queue_capacity == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--queue-capacity must be greater than zero")
            .with_hint("Use a positive value like 1024."));
    }
    if config.read_chunk_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--read-chunk-size must be greater than zero")
            .with_hint("Use a positive value like 8192."));
    }
    if config.append_timeout_ms == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--append-timeout-ms must be greater than zero")
            .with_hint("Use a positive value like 120000."));
    }
    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 67108864."));
    }
    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// `GET /api/{pipeline_id}/output/{step_id}` query; values are parsed by hand so
/// bad input gets the JSON error envelope.
#[derive(Debug, Default, Deserialize)]
struct OutputQuery {
    position: Option<String>,
    lines: Option<String>,
    backward: Option<String>,
    lines_only: Option<String>,
    html: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

async fn append_output(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((pipeline_id, step_id)): AxumPath<(String, String)>,
    body: Body,
) -> Response {
    let relative = match parse_step_id(&step_id)
        .and_then(|step_id| storage_paths::step_output(&pipeline_id, step_id))
    {
        Ok(relative) => relative,
        Err(err) => return error_response(err),
    };
    append_body(&state, &relative, &headers, body).await
}

async fn append_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((pipeline_id, path)): AxumPath<(String, String)>,
    body: Body,
) -> Response {
    let relative = match storage_paths::artifact(&pipeline_id, &path) {
        Ok(relative) => relative,
        Err(err) => return error_response(err),
    };
    append_body(&state, &relative, &headers, body).await
}

async fn append_body(state: &AppState, relative: &str, headers: &HeaderMap, body: Body) -> Response {
    let compressed = is_gzip(headers);
    let source = match body_source(body, compressed, state.max_body_bytes).await {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    match state.store.append(relative, source, compressed).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(err),
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("gzip"))
}

/// A compressed body is inflated as one chunk, so it is collected first.
async fn body_source(body: Body, compressed: bool, limit: usize) -> Result<ByteStream, Error> {
    if compressed {
        let bytes = axum::body::to_bytes(body, limit).await.map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("failed to read compressed request body")
                .with_hint("Compressed bodies must fit within --max-body-bytes.")
                .with_source(err)
        })?;
        return Ok(Box::pin(futures::stream::iter([Ok(DataChunk::new(bytes))])));
    }
    let mut received = 0usize;
    let stream = body.into_data_stream().map(move |frame| {
        let bytes = frame.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read request body")
                .with_source(err)
        })?;
        received += bytes.len();
        if received > limit {
            return Err(Error::new(ErrorKind::Usage).with_message("request body too large"));
        }
        Ok(DataChunk::new(bytes))
    });
    Ok(Box::pin(stream))
}

async fn get_output(
    State(state): State<Arc<AppState>>,
    AxumPath((pipeline_id, step_id)): AxumPath<(String, String)>,
    Query(query): Query<OutputQuery>,
) -> Response {
    let request = parse_step_id(&step_id).and_then(|step_id| {
        let relative = storage_paths::step_output(&pipeline_id, step_id)?;
        Ok((step_id, relative, line_query(&query)?, parse_flag("html", &query.html)?))
    });
    let (step_id, relative, line_query, html) = match request {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    let window = match state.store.find_lines(&relative, line_query).await {
        Ok(window) => window,
        Err(err) => return error_response(err),
    };

    let mut response = if html {
        let stream = state
            .store
            .encode(&window.segment, LineMarkup::html())
            .map(|item| item.map(Encoded::into_bytes));
        let mut response = Response::new(Body::from_stream(stream));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    } else {
        let stream = state
            .store
            .open_range(&window.segment)
            .map(|item| item.map(|chunk| chunk.data().clone()));
        let mut response = Response::new(Body::from_stream(stream));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        if let Ok(value) =
            HeaderValue::from_str(&format!("attachment; filename=\"{pipeline_id}-{step_id}.log\""))
        {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
        response
    };
    insert_window_headers(response.headers_mut(), &window);
    response
}

async fn get_artifact(
    State(state): State<Arc<AppState>>,
    AxumPath((pipeline_id, path)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let request = storage_paths::artifact(&pipeline_id, &path).and_then(|relative| {
        let download = parse_flag("download", &query.get("download").cloned())?;
        Ok((relative, download))
    });
    let (relative, download) = match request {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    let segment = match state.store.segment(&relative, 0, None) {
        Ok(segment) => segment,
        Err(err) => return error_response(err),
    };
    let stream = state
        .store
        .open_range(&segment)
        .map(|item| item.map(|chunk| chunk.data().clone()));
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if download {
        let file_name = segment
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\"")) {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
    }
    response
}

fn insert_window_headers(headers: &mut HeaderMap, window: &LineWindow) {
    let values = [
        (LINES_HEADER, window.reported_lines().to_string()),
        (REMAINING_HEADER, window.remaining.to_string()),
        (POSITION_HEADER, window.position.to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn parse_step_id(raw: &str) -> Result<u64, Error> {
    raw.parse::<u64>().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid step id: {raw}"))
            .with_hint("Step ids are positive integers.")
    })
}

fn line_query(query: &OutputQuery) -> Result<LineQuery, Error> {
    Ok(LineQuery {
        position: parse_number("position", &query.position)?.unwrap_or(0),
        max_lines: parse_number("lines", &query.lines)?,
        lines_only: parse_flag("lines_only", &query.lines_only)?,
        backward: parse_flag("backward", &query.backward)?,
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &Option<String>) -> Result<Option<T>, Error> {
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|_| {
            Error::new(ErrorKind::Usage).with_message(format!("invalid {name}: {value}"))
        }),
    }
}

/// A present flag with an empty value counts as `true`.
fn parse_flag(name: &str, raw: &Option<String>) -> Result<bool, Error> {
    match raw.as_deref() {
        None => Ok(false),
        Some("") | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(value) => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {name}: {value}"))
            .with_hint("Use true, false, or an empty value.")),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::Decode => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
        ErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            offset: err.offset(),
        },
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::{
        AppState, ErrorKind, OutputQuery, ServeConfig, line_query, parse_flag, router, serve,
        status_for, validate_config,
    };
    use axum::http::StatusCode;
    use pipelog::api::{LogStore, StoreOptions};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn config(dir: &std::path::Path) -> ServeConfig {
        ServeConfig {
            bind: "127.0.0.1:0".parse().expect("bind"),
            storage_dir: dir.to_path_buf(),
            appender_threads: 2,
            queue_capacity: 1024,
            read_chunk_size: 8192,
            append_timeout_ms: 120_000,
            max_body_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn serve_rejects_zero_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ServeConfig {
            appender_threads: 0,
            ..config(temp.path())
        };
        let err = serve(config).await.expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn limits_require_positive_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        validate_config(&config(temp.path())).expect("defaults are valid");
        let bad = [
            ServeConfig { queue_capacity: 0, ..config(temp.path()) },
            ServeConfig { read_chunk_size: 0, ..config(temp.path()) },
            ServeConfig { append_timeout_ms: 0, ..config(temp.path()) },
            ServeConfig { max_body_bytes: 0, ..config(temp.path()) },
        ];
        for config in bad {
            let err = validate_config(&config).expect_err("expected usage error");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn flags_accept_empty_values() {
        assert!(!parse_flag("html", &None).expect("absent"));
        assert!(parse_flag("html", &Some(String::new())).expect("empty"));
        assert!(parse_flag("html", &Some("true".into())).expect("true"));
        assert!(!parse_flag("html", &Some("false".into())).expect("false"));
        let err = parse_flag("html", &Some("yes".into())).expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn output_query_maps_to_line_query() {
        let query = OutputQuery {
            position: Some("12".into()),
            lines: Some("5".into()),
            backward: Some(String::new()),
            ..OutputQuery::default()
        };
        let parsed = line_query(&query).expect("query");
        assert_eq!(parsed.position, 12);
        assert_eq!(parsed.max_lines, Some(5));
        assert!(parsed.backward);
        assert!(!parsed.lines_only);

        let query = OutputQuery {
            lines: Some("many".into()),
            ..OutputQuery::default()
        };
        assert_eq!(line_query(&query).expect_err("bad").kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::Usage), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Decode), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::InvalidRange), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(status_for(ErrorKind::QueueFull), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Io), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    struct Reply {
        head: String,
        body: Vec<u8>,
    }

    impl Reply {
        fn status(&self) -> u16 {
            self.head
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse().ok())
                .unwrap_or(0)
        }

        fn header(&self, name: &str) -> Option<String> {
            self.head.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
            })
        }
    }

    fn dechunk(mut raw: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let Some(end) = raw.windows(2).position(|w| w == b"\r\n") else {
                return out;
            };
            let size_text = String::from_utf8_lossy(&raw[..end]).to_string();
            let size = usize::from_str_radix(size_text.trim(), 16).expect("chunk size");
            if size == 0 {
                return out;
            }
            let start = end + 2;
            out.extend_from_slice(&raw[start..start + size]);
            raw = &raw[start + size + 2..];
        }
    }

    async fn request(addr: std::net::SocketAddr, method: &str, target: &str, body: &[u8]) -> Reply {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let head = format!(
            "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.expect("write head");
        stream.write_all(body).await.expect("write body");
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read");
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header end");
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let rest = &raw[split + 4..];
        let chunked = head.to_ascii_lowercase().contains("transfer-encoding: chunked");
        let body = if chunked { dechunk(rest) } else { rest.to_vec() };
        Reply { head, body }
    }

    #[tokio::test]
    async fn upload_then_tail_over_http() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LogStore::open(temp.path(), StoreOptions::default()).expect("store");
        let state = Arc::new(AppState {
            store,
            max_body_bytes: 1024 * 1024,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let reply = request(addr, "PUT", "/output/77/1", b"line1\nline2\n").await;
        assert_eq!(reply.status(), 200);
        let reply = request(addr, "PUT", "/output/77/1", b"line3\nline4\n").await;
        assert_eq!(reply.status(), 200);

        let reply = request(addr, "GET", "/api/77/output/1?lines=2&backward", b"").await;
        assert_eq!(reply.status(), 200);
        assert_eq!(reply.body, b"line3\nline4\n");
        assert_eq!(reply.header("x-pipelog-lines").as_deref(), Some("2"));
        assert_eq!(reply.header("x-pipelog-remaining").as_deref(), Some("12"));
        assert_eq!(reply.header("x-pipelog-position").as_deref(), Some("24"));
        assert!(reply
            .header("content-disposition")
            .is_some_and(|value| value.contains("77-1.log")));

        let reply = request(addr, "GET", "/api/77/output/1?position=18&html=true", b"").await;
        assert_eq!(reply.status(), 200);
        let page = String::from_utf8_lossy(&reply.body).to_string();
        assert!(page.contains("<div class=\"line\">line4</div>"));
        assert!(!page.contains("line3"));
        assert_eq!(reply.header("x-pipelog-lines").as_deref(), Some("-1"));

        let reply = request(addr, "GET", "/api/77/output/2", b"").await;
        assert_eq!(reply.status(), 404);
        let reply = request(addr, "GET", "/api/77/output/1?position=99", b"").await;
        assert_eq!(reply.status(), 416);
        let reply = request(addr, "GET", "/api/77/output/0", b"").await;
        assert_eq!(reply.status(), 400);

        let reply = request(addr, "PUT", "/artifacts/77/reports/junit.xml", b"<xml/>").await;
        assert_eq!(reply.status(), 200);
        let reply = request(addr, "GET", "/api/77/artifacts/reports/junit.xml?download", b"").await;
        assert_eq!(reply.status(), 200);
        assert_eq!(reply.body, b"<xml/>");
        assert!(reply
            .header("content-disposition")
            .is_some_and(|value| value.contains("junit.xml")));
    }
}
