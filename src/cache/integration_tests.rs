//! End-to-end tests for the caching proxy
//!
//! These drive the public server against a mock upstream:
//! - the loopback listener parsing raw requests
//! - engines mixing cached and network bytes
//! - catch-up caching and completion
//! - the facade's URL decisions
//!
//! The upstream is a small axum app with range support and a request counter.

#![cfg(test)]

use super::*;
use crate::constants::HOST;
use crate::server::ProxyCacheServer;
use crate::utils::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::Response,
    routing::get,
};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const FILE_SIZE: usize = 256 * 1024;
const WAIT: Duration = Duration::from_secs(10);

/// Mock upstream media server state
struct MockUpstream {
    content: Vec<u8>,
    /// GET requests received (HEAD probes excluded)
    get_count: AtomicU64,
}

impl MockUpstream {
    fn new(size: usize) -> Self {
        Self {
            content: (0..size).map(|i| (i % 251) as u8).collect(),
            get_count: AtomicU64::new(0),
        }
    }

    fn get_count(&self) -> u64 {
        self.get_count.load(Ordering::SeqCst)
    }
}

async fn serve_file(
    State(state): State<Arc<MockUpstream>>,
    method: axum::http::Method,
    headers: HeaderMap,
) -> Response {
    if method == axum::http::Method::GET {
        state.get_count.fetch_add(1, Ordering::SeqCst);
    }
    let total = state.content.len() as u64;

    let start = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range_start)
        .filter(|start| *start < total);

    match start {
        Some(start) => {
            let body = state.content[start as usize..].to_vec();
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::CONTENT_LENGTH, body.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, total - 1, total),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from(body))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, total)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from(state.content.clone()))
            .unwrap(),
    }
}

/// Start of a `bytes=start-` or `bytes=start-end` range
fn parse_range_start(value: &str) -> Option<u64> {
    let range = value.strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.parse().ok()
}

/// Start the mock upstream; returns its state and the URL of the media file.
async fn start_upstream(size: usize) -> (Arc<MockUpstream>, String) {
    let state = Arc::new(MockUpstream::new(size));
    let app = Router::new()
        .route("/video.mp4", get(serve_file))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, format!("http://{}/video.mp4", addr))
}

async fn start_server(temp_dir: &TempDir) -> ProxyCacheServer {
    ProxyCacheServer::builder()
        .root_dir(temp_dir.path())
        .cache_storage(Arc::new(MemoryStorage::new()))
        .max_timeouts(Duration::from_millis(500))
        .build()
        .await
        .unwrap()
}

/// Path component of a proxied URL
fn proxy_path(server: &ProxyCacheServer, proxied: &str) -> String {
    let prefix = format!("http://{}:{}", HOST, server.port());
    proxied
        .strip_prefix(&prefix)
        .unwrap_or_else(|| panic!("{} is not proxied", proxied))
        .to_string()
}

/// Raw GET against the proxy; returns the response head and body.
async fn fetch(port: u16, path: &str, offset: Option<u64>) -> (String, Vec<u8>) {
    let exchange = async {
        let mut stream = TcpStream::connect((HOST, port)).await.unwrap();
        let mut request = format!("GET {} HTTP/1.1\r\nHost: {}:{}\r\n", path, HOST, port);
        if let Some(offset) = offset {
            request.push_str(&format!("Range: bytes={}-\r\n", offset));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        raw
    };
    let raw = tokio::time::timeout(WAIT, exchange).await.unwrap();

    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .unwrap();
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    (head, raw[split + 4..].to_vec())
}

async fn wait_until_cached(server: &ProxyCacheServer, url: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !server.is_cached(url) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} was never cached",
            url
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_full_request_is_relayed_and_cached() {
    let (upstream, url) = start_upstream(FILE_SIZE).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;

    let proxied = server.proxy_url(&url).await;
    let path = proxy_path(&server, &proxied);

    let (head, body) = fetch(server.port(), &path, None).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains(&format!("Content-Length: {}", FILE_SIZE)));
    assert!(head.contains("Content-Type: video/mp4"));
    assert_eq!(body, upstream.content);

    wait_until_cached(&server, &url).await;
    let cached = std::fs::read(server.cached_file(&url).unwrap()).unwrap();
    assert_eq!(cached, upstream.content);

    // A completed cache is served from disk without touching the network
    let gets = upstream.get_count();
    let (head, body) = fetch(server.port(), &path, Some(1000)).await;
    assert!(head.starts_with("HTTP/1.1 206 PARTIAL CONTENT"));
    assert_eq!(body, &upstream.content[1000..]);
    assert_eq!(upstream.get_count(), gets);

    server.shutdown().await;
}

#[tokio::test]
async fn test_ranged_request_returns_tail_and_caches_in_background() {
    let (upstream, url) = start_upstream(FILE_SIZE).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;
    let path = proxy_path(&server, &server.proxy_url(&url).await);

    let offset = 100_000u64;
    let (head, body) = fetch(server.port(), &path, Some(offset)).await;

    assert!(head.starts_with("HTTP/1.1 206 PARTIAL CONTENT"));
    assert!(head.contains(&format!(
        "Content-Length: {}",
        FILE_SIZE as u64 - offset
    )));
    assert!(head.contains(&format!(
        "Content-Range: bytes {}-{}/{}",
        offset,
        FILE_SIZE - 1,
        FILE_SIZE
    )));
    assert!(head.contains("Accept-Ranges: bytes"));
    assert_eq!(body, &upstream.content[offset as usize..]);

    wait_until_cached(&server, &url).await;
    let cached = std::fs::read(server.cached_file(&url).unwrap()).unwrap();
    assert_eq!(cached, upstream.content);
    assert_eq!(server.stats().catch_up_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_seeks_start_a_single_catch_up() {
    let (upstream, url) = start_upstream(FILE_SIZE).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;
    let path = proxy_path(&server, &server.proxy_url(&url).await);
    let port = server.port();

    let seeks = (1..=8u64).map(|i| {
        let path = path.clone();
        async move { fetch(port, &path, Some(i * 20_000)).await }
    });
    let responses = join_all(seeks).await;
    for (head, _) in &responses {
        assert!(head.starts_with("HTTP/1.1 206 PARTIAL CONTENT"));
    }

    wait_until_cached(&server, &url).await;
    assert_eq!(server.stats().catch_up_count(), 1);
    let cached = std::fs::read(server.cached_file(&url).unwrap()).unwrap();
    assert_eq!(cached, upstream.content);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cached_url_is_handed_out_as_file_url() {
    let (upstream, url) = start_upstream(4096).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;

    let path = proxy_path(&server, &server.proxy_url(&url).await);
    fetch(server.port(), &path, None).await;
    wait_until_cached(&server, &url).await;

    let local = server.proxy_url(&url).await;
    assert!(local.starts_with("file://"));
    let file = url::Url::parse(&local).unwrap().to_file_path().unwrap();
    assert_eq!(std::fs::read(file).unwrap(), upstream.content);

    server.shutdown().await;
}

#[tokio::test]
async fn test_clear_cache_forces_refetch() {
    let (upstream, url) = start_upstream(4096).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;

    let path = proxy_path(&server, &server.proxy_url(&url).await);
    fetch(server.port(), &path, None).await;
    wait_until_cached(&server, &url).await;

    server.clear_cache(&url).await.unwrap();
    assert!(!server.is_cached(&url));

    let proxied = server.proxy_url(&url).await;
    assert_eq!(proxy_path(&server, &proxied), path);
    let gets = upstream.get_count();
    let (_, body) = fetch(server.port(), &path, None).await;
    assert_eq!(body, upstream.content);
    assert!(upstream.get_count() > gets);

    server.shutdown().await;
}

#[tokio::test]
async fn test_filter_rejection_returns_original_url() {
    let (_upstream, url) = start_upstream(4096).await;
    let temp_dir = TempDir::new().unwrap();
    let server = ProxyCacheServer::builder()
        .root_dir(temp_dir.path())
        .cache_storage(Arc::new(MemoryStorage::new()))
        .url_filter(Arc::new(|url: &str| !url.ends_with(".mp4")))
        .build()
        .await
        .unwrap();

    assert_eq!(server.proxy_url(&url).await, url);
    assert_eq!(server.stats().ping_requests.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_progress_callback_reports_completion() {
    let (_upstream, url) = start_upstream(FILE_SIZE).await;
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
    let callback: Arc<dyn CacheCallback> = Arc::new(tx);
    let proxied = server.proxy_url_with(&url, None, Some(callback)).await;
    fetch(server.port(), &proxy_path(&server, &proxied), None).await;

    let finished = tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if let CacheEvent::Progress {
                percent,
                finished: true,
                ..
            } = event
            {
                return percent;
            }
        }
        0
    })
    .await
    .unwrap();
    assert_eq!(finished, 100);

    server.shutdown().await;
}

#[tokio::test]
async fn test_upstream_error_reaches_callback() {
    let (_upstream, url) = start_upstream(4096).await;
    let missing = url.replace("video.mp4", "missing.mp4");
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
    let callback: Arc<dyn CacheCallback> = Arc::new(tx);
    let proxied = server.proxy_url_with(&missing, None, Some(callback)).await;
    let (head, body) = fetch(server.port(), &proxy_path(&server, &proxied), None).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(body.is_empty());

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    match event {
        CacheEvent::Error { url, message } => {
            assert_eq!(url, missing);
            assert!(message.contains("404"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!server.is_cached(&missing));

    server.shutdown().await;
}

/// Source that never answers with the expected ping payload
struct WrongAnswerSource;

#[async_trait]
impl CacheSource for WrongAnswerSource {
    async fn open(&mut self, _offset: u64) -> Result<()> {
        Ok(())
    }

    async fn length(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn mime(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn test_unreachable_proxy_falls_back_to_original_url() {
    let temp_dir = TempDir::new().unwrap();
    let server = ProxyCacheServer::builder()
        .root_dir(temp_dir.path())
        .cache_storage(Arc::new(MemoryStorage::new()))
        .cache_source(Arc::new(
            |_: &str, _: Arc<CacheContext>| -> Box<dyn CacheSource> { Box::new(WrongAnswerSource) },
        ))
        .max_attempts(2)
        .max_timeouts(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    let url = "http://media.test/video.mp4";
    assert_eq!(server.proxy_url(url).await, url);

    server.shutdown().await;
    assert_eq!(server.proxy_url(url).await, url);
}
