#![forbid(unsafe_code)]

//! Axum backend that turns media URLs into locally stored files.
//!
//! Three endpoints: the landing page, a JSON download trigger, and an
//! attachment stream for previously fetched files. The storage quota is
//! probed opportunistically at the start of each download request; there is
//! no background sweeper.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal, task};
use tokio_util::io::ReaderStream;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidfetch::config::{RuntimeOverrides, resolve_runtime_config};
use vidfetch::fetcher::{FetchError, MediaFetcher, YtDlpFetcher};
use vidfetch::security::ensure_unprivileged;
use vidfetch::storage::{StorageRoot, sanitize_file_name};

const INDEX_HTML: &str = include_str!("../../assets/index.html");

// Per-client budget for POST /download: 3 per minute and 30 per hour,
// expressed as governor burst sizes with matching refill intervals.
const MINUTE_BUDGET: u32 = 3;
const MINUTE_REFILL_SECS: u64 = 20;
const HOUR_BUDGET: u32 = 30;
const HOUR_REFILL_SECS: u64 = 120;

#[derive(Debug, Clone)]
struct BackendArgs {
    download_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut download_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-root=") {
                download_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--download-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-root requires a value"))?;
                    download_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_config(RuntimeOverrides {
            download_root: download_root_override,
            port: port_override,
            host: host_override.map(|host| host.to_string()),
            ..RuntimeOverrides::default()
        })?;
        let listen_host = parse_host_arg(&runtime.host)?;

        Ok(Self {
            download_root: runtime.download_root,
            port: runtime.port,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

/// Shared state injected into every handler. The storage root is an explicit
/// value rather than a process-wide global so tests can point the whole
/// stack at an isolated temporary directory.
#[derive(Clone)]
struct AppState {
    root: StorageRoot,
    fetcher: Arc<dyn MediaFetcher>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    message: &'static str,
    file_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = BackendArgs::parse()?;
    ensure_unprivileged("backend")?;

    let root = StorageRoot::new(args.download_root);
    root.ensure_exists()
        .with_context(|| format!("creating {}", root.dir().display()))?;

    let state = AppState {
        root: root.clone(),
        fetcher: Arc::new(YtDlpFetcher::new(root)),
    };
    let app = build_app(state)?;

    let addr = SocketAddr::new(args.listen_host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("backend listening on http://{}", addr);

    // Rate limiting keys on the peer address, so the listener has to hand
    // ConnectInfo to every request.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running backend")?;

    Ok(())
}

async fn shutdown_signal() {
    // Failing to install the handler only costs us graceful shutdown; the
    // process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn build_app(state: AppState) -> Result<Router> {
    let per_minute = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(IpKeyExtractor)
            .per_second(MINUTE_REFILL_SECS)
            .burst_size(MINUTE_BUDGET)
            .finish()
            .ok_or_else(|| anyhow!("invalid per-minute rate limit configuration"))?,
    );
    let per_hour = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(IpKeyExtractor)
            .per_second(HOUR_REFILL_SECS)
            .burst_size(HOUR_BUDGET)
            .finish()
            .ok_or_else(|| anyhow!("invalid per-hour rate limit configuration"))?,
    );

    // Only the download trigger is throttled; serving already stored files
    // stays cheap and unthrottled.
    let throttled = Router::new()
        .route("/download", post(start_download))
        .layer(GovernorLayer::new(per_hour).error_handler(rate_limit_error_handler))
        .layer(GovernorLayer::new(per_minute).error_handler(rate_limit_error_handler));

    Ok(Router::new()
        .route("/", get(index))
        .route("/downloads/{filename}", get(serve_download))
        .merge(throttled)
        .with_state(state))
}

/// Keys the rate limiter by client IP taken from the connection info.
#[derive(Clone)]
struct IpKeyExtractor;

impl KeyExtractor for IpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

fn rate_limit_error_handler(err: GovernorError) -> Response {
    match err {
        GovernorError::TooManyRequests { wait_time, .. } => {
            warn!(wait_seconds = wait_time, "rate limit exceeded");
            let body = serde_json::json!({
                "error": "Too many requests",
            });
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        }
        other => {
            warn!(error = ?other, "rate limiter failure");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    // The quota probe runs at the very start of every download request,
    // before the payload is inspected.
    let root = state.root.clone();
    task::spawn_blocking(move || {
        if root.over_quota() {
            info!("storage quota exceeded, sweeping stale downloads");
            root.sweep_stale();
        }
    })
    .await
    .map_err(|err| {
        error!(error = %err, "storage sweep task failed to complete");
        ApiError::internal("Internal server error")
    })?;

    let url = payload
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let fetcher = state.fetcher.clone();
    // The extractor call is blocking; it runs off the async workers and
    // occupies one blocking thread for the full download duration.
    let outcome = task::spawn_blocking(move || fetcher.fetch(&url))
        .await
        .map_err(|err| {
            error!(error = %err, "download task failed to complete");
            ApiError::internal("Internal server error")
        })?;

    match outcome {
        Ok(media) => Ok(Json(DownloadResponse {
            message: "Download successful",
            file_path: media.file_name,
        })),
        Err(err @ (FetchError::Extraction(_) | FetchError::Download(_))) => {
            warn!(error = %err, "download rejected");
            Err(ApiError::bad_request("Download failed"))
        }
        Err(err @ FetchError::MissingOutput(_)) => {
            error!(error = %err, "download postcondition failed");
            Err(ApiError::internal("File download failed"))
        }
        Err(err) => {
            // Detail stays in the server log; callers only see a generic
            // message.
            error!(error = %err, "unexpected download failure");
            Err(ApiError::internal("Internal server error"))
        }
    }
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    let safe_name = sanitize_file_name(&filename);
    if safe_name.is_empty() {
        return Err(ApiError::not_found("file not found"));
    }

    let path = state.root.dir().join(&safe_name);
    stream_attachment(path, &safe_name).await
}

/// Streams a stored file back as a download attachment.
async fn stream_attachment(path: PathBuf, download_name: &str) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let mime = MimeGuess::from_path(&path)
        .first()
        .map(|mime| mime.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    // The name is already sanitized to plain ASCII, so these header values
    // always parse.
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{download_name}\""))
        .map_err(|_| ApiError::internal("could not build response headers"))?;

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    if let Ok(value) = mime.parse() {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::extract::State as AxumState;
    use serde_json::Value;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;
    use vidfetch::fetcher::FetchedMedia;

    #[derive(Clone, Copy)]
    enum MockOutcome {
        Success,
        ExtractionError,
        DownloadError,
        MissingOutput,
        Unexpected,
    }

    /// Canned extraction collaborator; counts invocations and writes a file
    /// into the root on success like the real fetcher would.
    struct MockFetcher {
        outcome: MockOutcome,
        root: StorageRoot,
        calls: AtomicUsize,
    }

    const MOCK_FILE_NAME: &str = "video_1700000000_Example.mp4";

    impl MockFetcher {
        fn new(outcome: MockOutcome, root: StorageRoot) -> Self {
            Self {
                outcome,
                root,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MediaFetcher for MockFetcher {
        fn fetch(&self, _url: &str) -> Result<FetchedMedia, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                MockOutcome::Success => {
                    fs::write(self.root.dir().join(MOCK_FILE_NAME), b"data").unwrap();
                    Ok(FetchedMedia {
                        file_name: MOCK_FILE_NAME.to_string(),
                        title: "Example".to_string(),
                        ext: "mp4".to_string(),
                    })
                }
                MockOutcome::ExtractionError => {
                    Err(FetchError::Extraction("ERROR: Unsupported URL".into()))
                }
                MockOutcome::DownloadError => {
                    Err(FetchError::Download("ERROR: HTTP Error 403".into()))
                }
                MockOutcome::MissingOutput => {
                    Err(FetchError::MissingOutput(MOCK_FILE_NAME.to_string()))
                }
                MockOutcome::Unexpected => Err(FetchError::Other(anyhow!("secret detail"))),
            }
        }
    }

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        root: StorageRoot,
        fetcher: Arc<MockFetcher>,
        state: AppState,
    }

    impl BackendTestContext {
        fn new(outcome: MockOutcome) -> Self {
            let temp = tempdir().unwrap();
            let root = StorageRoot::new(temp.path().to_path_buf());
            Self::with_root(temp, root, outcome)
        }

        fn with_root(temp: tempfile::TempDir, root: StorageRoot, outcome: MockOutcome) -> Self {
            let fetcher = Arc::new(MockFetcher::new(outcome, root.clone()));
            let state = AppState {
                root: root.clone(),
                fetcher: fetcher.clone(),
            };
            Self {
                _temp: temp,
                root,
                fetcher,
                state,
            }
        }

        fn entry_count(&self) -> usize {
            fs::read_dir(self.root.dir()).unwrap().count()
        }
    }

    fn download_body(url: Option<&str>) -> Json<DownloadRequest> {
        Json(DownloadRequest {
            url: url.map(|url| url.to_string()),
        })
    }

    #[tokio::test]
    async fn missing_url_is_rejected_without_fetching() {
        let ctx = BackendTestContext::new(MockOutcome::Success);

        let err = start_download(AxumState(ctx.state.clone()), download_body(None))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "URL is required");
        assert_eq!(ctx.fetcher.calls(), 0);
        assert_eq!(ctx.entry_count(), 0);
    }

    #[tokio::test]
    async fn blank_url_is_rejected_without_fetching() {
        let ctx = BackendTestContext::new(MockOutcome::Success);

        let err = start_download(AxumState(ctx.state.clone()), download_body(Some("   ")))
            .await
            .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(ctx.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn successful_download_returns_bare_filename() {
        let ctx = BackendTestContext::new(MockOutcome::Success);

        let Json(response) = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap();

        assert_eq!(response.message, "Download successful");
        assert_eq!(response.file_path, MOCK_FILE_NAME);
        assert!(ctx.root.dir().join(MOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn extraction_errors_map_to_generic_bad_request() {
        let ctx = BackendTestContext::new(MockOutcome::ExtractionError);

        let err = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/nope")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Download failed");
    }

    #[tokio::test]
    async fn download_errors_map_to_generic_bad_request() {
        let ctx = BackendTestContext::new(MockOutcome::DownloadError);

        let err = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Download failed");
    }

    #[tokio::test]
    async fn missing_output_is_a_server_error() {
        let ctx = BackendTestContext::new(MockOutcome::MissingOutput);

        let err = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "File download failed");
    }

    #[tokio::test]
    async fn unexpected_errors_never_leak_detail() {
        let ctx = BackendTestContext::new(MockOutcome::Unexpected);

        let err = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");
        assert!(!err.message.contains("secret detail"));
    }

    #[tokio::test]
    async fn quota_excess_sweeps_stale_files_before_fetching() {
        let temp = tempdir().unwrap();
        // Tiny quota and retention so the pre-written file is both over
        // quota and stale by the time the request arrives.
        let root = StorageRoot::with_limits(
            temp.path().to_path_buf(),
            10,
            Duration::from_millis(50),
        );
        fs::write(root.dir().join("video_1_old.mp4"), vec![0u8; 100]).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let ctx = BackendTestContext::with_root(temp, root, MockOutcome::Success);
        let Json(response) = start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap();

        assert_eq!(response.file_path, MOCK_FILE_NAME);
        assert!(!ctx.root.dir().join("video_1_old.mp4").exists());
        assert!(ctx.root.dir().join(MOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn quota_sweep_runs_even_when_the_url_is_missing() {
        let temp = tempdir().unwrap();
        let root = StorageRoot::with_limits(
            temp.path().to_path_buf(),
            10,
            Duration::from_millis(50),
        );
        fs::write(root.dir().join("video_1_old.mp4"), vec![0u8; 100]).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let ctx = BackendTestContext::with_root(temp, root, MockOutcome::Success);
        let err = start_download(AxumState(ctx.state.clone()), download_body(None))
            .await
            .unwrap_err();

        // The request is still rejected, but the sweep has already run.
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!ctx.root.dir().join("video_1_old.mp4").exists());
        assert_eq!(ctx.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn under_quota_requests_do_not_sweep() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        fs::write(ctx.root.dir().join("video_1_keep.mp4"), b"small").unwrap();

        start_download(
            AxumState(ctx.state.clone()),
            download_body(Some("https://example.test/watch?v=abc")),
        )
        .await
        .unwrap();

        assert!(ctx.root.dir().join("video_1_keep.mp4").exists());
    }

    #[tokio::test]
    async fn stored_files_stream_back_as_attachments() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        fs::write(ctx.root.dir().join(MOCK_FILE_NAME), b"data").unwrap();

        let response = serve_download(
            AxumState(ctx.state.clone()),
            AxumPath(MOCK_FILE_NAME.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains(MOCK_FILE_NAME));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"data");
    }

    #[tokio::test]
    async fn absent_files_return_not_found() {
        let ctx = BackendTestContext::new(MockOutcome::Success);

        let err = serve_download(
            AxumState(ctx.state.clone()),
            AxumPath("video_1_missing.mp4".to_string()),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_names_cannot_escape_the_download_root() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        // A file that a traversal past the root could reach if sanitization
        // were broken.
        let outside = ctx._temp.path().join("..").join("vidfetch-secret");
        let _ = fs::write(&outside, b"secret");

        for name in ["../../etc/passwd", "..%2F..%2Fetc%2Fpasswd", "....//etc"] {
            let err = serve_download(
                AxumState(ctx.state.clone()),
                AxumPath(name.to_string()),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status, StatusCode::NOT_FOUND, "name {name:?} must 404");
        }

        let _ = fs::remove_file(outside);
    }

    #[tokio::test]
    async fn index_serves_the_landing_page() {
        let Html(page) = index().await;
        assert!(page.contains("<form"));
        assert!(page.contains("/download"));
    }

    fn post_download(ip: [u8; 4]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/download")
            .header("content-type", "application/json")
            .extension(ConnectInfo(SocketAddr::from((ip, 43210))))
            .body(Body::from(r#"{"url":"https://example.test/watch?v=abc"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn downloads_beyond_the_budget_are_rejected_before_fetching() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        let app = build_app(ctx.state.clone()).unwrap();

        for _ in 0..MINUTE_BUDGET {
            let response = app.clone().oneshot(post_download([10, 0, 0, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(post_download([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Too many requests");

        // The rejected request never reached the orchestrator.
        assert_eq!(ctx.fetcher.calls(), MINUTE_BUDGET as usize);
    }

    #[tokio::test]
    async fn rate_limits_are_tracked_per_client_address() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        let app = build_app(ctx.state.clone()).unwrap();

        for _ in 0..MINUTE_BUDGET {
            let response = app.clone().oneshot(post_download([10, 0, 0, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let throttled = app.clone().oneshot(post_download([10, 0, 0, 1])).await.unwrap();
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different client still has a full budget.
        let response = app.clone().oneshot(post_download([10, 0, 0, 2])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn routed_post_without_url_returns_error_envelope() {
        let ctx = BackendTestContext::new(MockOutcome::Success);
        let app = build_app(ctx.state.clone()).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/download")
            .header("content-type", "application/json")
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 3], 43210))))
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "URL is required");
        assert_eq!(ctx.fetcher.calls(), 0);
        assert_eq!(ctx.entry_count(), 0);
    }

    #[test]
    fn args_parse_flag_forms() {
        let args = BackendArgs::from_iter(
            [
                "--download-root=/tmp/dl".to_string(),
                "--port".to_string(),
                "8123".to_string(),
                "--host=127.0.0.1".to_string(),
            ]
            .into_iter(),
        )
        .unwrap();

        assert_eq!(args.download_root, PathBuf::from("/tmp/dl"));
        assert_eq!(args.port, 8123);
        assert_eq!(args.listen_host, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn args_reject_unknown_flags() {
        let err = BackendArgs::from_iter(["--bogus".to_string()].into_iter()).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }
}
