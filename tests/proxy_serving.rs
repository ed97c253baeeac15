//! End-to-end tests: a real proxy listener in front of an in-process
//! upstream with Range support.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use media_proxy::task::{CONFIG_FILE_NAME, DownloadTask};
use media_proxy::{ProxyConfig, ProxyServer};

struct Upstream {
    data: Vec<u8>,
    requests: AtomicUsize,
    ranges: Mutex<Vec<String>>,
}

async fn upstream_media(State(upstream): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    upstream.requests.fetch_add(1, Ordering::Relaxed);
    let total = upstream.data.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(raw) = range {
        upstream.ranges.lock().push(raw.clone());
        let value = raw.strip_prefix("bytes=").unwrap();
        let (start, end) = value.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end: usize = end
            .parse::<usize>()
            .map(|e| e.min(total - 1))
            .unwrap_or(total - 1);
        let body = upstream.data[start..=end].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::ACCEPT_RANGES, "bytes")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, total)
        .body(Body::from(upstream.data.clone()))
        .unwrap()
}

fn init_tracing() {
    static INIT: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("media_proxy=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

async fn spawn_upstream(data: Vec<u8>) -> (Arc<Upstream>, String) {
    init_tracing();
    let upstream = Arc::new(Upstream {
        data,
        requests: AtomicUsize::new(0),
        ranges: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/clip.mp4", get(upstream_media))
        .with_state(Arc::clone(&upstream));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (upstream, format!("http://{addr}/clip.mp4"))
}

/// An MP4-shaped byte pattern: `ftyp`, a large `mdat`, and a trailing `moov`.
fn mp4_with_trailing_moov(total: usize) -> Vec<u8> {
    const MOOV_SIZE: usize = 512;
    let mut data = Vec::with_capacity(total);

    // ftyp
    data.extend_from_slice(&24u32.to_be_bytes());
    data.extend_from_slice(b"ftyp");
    data.extend_from_slice(b"isomiso2avc1mp41");

    // mdat fills the middle
    let mdat_size = total - data.len() - MOOV_SIZE;
    data.extend_from_slice(&(mdat_size as u32).to_be_bytes());
    data.extend_from_slice(b"mdat");
    for i in 0..mdat_size - 8 {
        data.push(((i * 31 + 7) % 251) as u8);
    }

    // moov at the tail
    data.extend_from_slice(&(MOOV_SIZE as u32).to_be_bytes());
    data.extend_from_slice(b"moov");
    data.extend(std::iter::repeat_n(0xABu8, MOOV_SIZE - 8));

    assert_eq!(data.len(), total);
    data
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        segment_size: 64 * 1024,
        // Force moov detection even for small test files.
        skip_moov_detection_threshold: 1,
        serve_poll_interval: Duration::from_millis(50),
        ..ProxyConfig::default()
    }
}

async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn cold_mp4_full_range_is_byte_identical_and_prefetches_tail() {
    let total = 320 * 1024;
    let data = mp4_with_trailing_moov(total);
    let (upstream, media_url) = spawn_upstream(data.clone()).await;

    let cache_root = tempfile::tempdir().unwrap();
    let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();

    let client = reqwest::Client::new();
    let response = client.get(&proxy_url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_RANGE)
            .unwrap()
            .to_str()
            .unwrap(),
        format!("bytes 0-{}/{}", total - 1, total)
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCEPT_RANGES)
            .unwrap()
            .to_str()
            .unwrap(),
        "bytes"
    );

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), total);
    assert_eq!(&body[..], &data[..], "proxied bytes must match upstream");

    // The tail segment (moov insurance) must have been committed.
    // 320 KiB divides evenly into five 64 KiB segments.
    let cache_dir = cache_root
        .path()
        .join(DownloadTask::dir_hash(&media_url, &HashMap::new()));
    let tail_start = total - 64 * 1024;
    let tail_path = cache_dir.join(format!("{}_{}.seg", tail_start, total - 1));
    assert!(
        wait_for_file(&tail_path, Duration::from_secs(3)).await,
        "tail segment missing at {}",
        tail_path.display()
    );

    // Upstream was reached with ranged GETs.
    assert!(upstream.requests.load(Ordering::Relaxed) > 0);
    assert!(!upstream.ranges.lock().is_empty());
}

#[tokio::test]
async fn warm_cache_serves_without_touching_upstream() {
    let total = 192 * 1024;
    let data = mp4_with_trailing_moov(total);
    let (upstream, media_url) = spawn_upstream(data.clone()).await;

    let cache_root = tempfile::tempdir().unwrap();
    let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();
    let client = reqwest::Client::new();

    // Warm the cache with a full fetch.
    let body = client
        .get(&proxy_url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], &data[..]);

    // Let the session tear down and the tail insurance settle.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let hits_after_warmup = upstream.requests.load(Ordering::Relaxed);

    let response = client
        .get(&proxy_url)
        .header(header::RANGE, "bytes=0-1023")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &data[..1024]);

    assert_eq!(
        upstream.requests.load(Ordering::Relaxed),
        hits_after_warmup,
        "warm serve must not contact the upstream"
    );
}

#[tokio::test]
async fn partial_temp_file_resumes_from_its_offset() {
    let total = 192 * 1024;
    let segment_size = 64 * 1024usize;
    let resume_at = 32 * 1024usize;
    let data = mp4_with_trailing_moov(total);
    let (upstream, media_url) = spawn_upstream(data.clone()).await;

    // Seed the cache: known length plus half of segment 0 in a `.tmp`.
    let cache_root = tempfile::tempdir().unwrap();
    let cache_dir = cache_root
        .path()
        .join(DownloadTask::dir_hash(&media_url, &HashMap::new()));
    tokio::fs::create_dir_all(&cache_dir).await.unwrap();
    let config_json = serde_json::json!({
        "contentLength": total,
        "contentType": "video/mp4",
        "lastAccessTime": chrono::Utc::now().timestamp_millis(),
        "requestHeaders": null,
        "segments": [],
    });
    tokio::fs::write(cache_dir.join(CONFIG_FILE_NAME), config_json.to_string())
        .await
        .unwrap();
    tokio::fs::write(
        cache_dir.join(format!("0_{}.tmp", segment_size - 1)),
        &data[..resume_at],
    )
    .await
    .unwrap();

    let config = ProxyConfig {
        // Skip moov probing noise: the interesting traffic is the resume.
        skip_moov_detection_threshold: u64::MAX,
        ..test_config()
    };
    let server = ProxyServer::new(cache_root.path(), config).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();

    let body = reqwest::Client::new()
        .get(&proxy_url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], &data[..], "resumed bytes must match upstream");

    // Exactly one request for segment 0, starting at the resume offset.
    let ranges = upstream.ranges.lock().clone();
    assert!(
        ranges
            .iter()
            .any(|r| r == &format!("bytes={}-{}", resume_at, segment_size - 1)),
        "no resume request found in {ranges:?}"
    );
    assert!(
        !ranges.iter().any(|r| r == &format!("bytes=0-{}", segment_size - 1)),
        "segment 0 was re-fetched from scratch: {ranges:?}"
    );

    // The committed segment has the full size.
    let seg0 = cache_dir.join(format!("0_{}.seg", segment_size - 1));
    assert!(wait_for_file(&seg0, Duration::from_secs(3)).await);
    assert_eq!(
        tokio::fs::metadata(&seg0).await.unwrap().len(),
        segment_size as u64
    );
}

#[tokio::test]
async fn range_beyond_eof_is_clamped_to_content_length() {
    let total = 128 * 1024;
    let data = mp4_with_trailing_moov(total);
    let (_upstream, media_url) = spawn_upstream(data.clone()).await;

    let cache_root = tempfile::tempdir().unwrap();
    let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();

    let response = reqwest::Client::new()
        .get(&proxy_url)
        .header(header::RANGE, format!("bytes=65536-{}", total * 10))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_RANGE)
            .unwrap()
            .to_str()
            .unwrap(),
        format!("bytes 65536-{}/{}", total - 1, total)
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &data[65536..]);
}

#[tokio::test]
async fn concurrent_sessions_share_one_task() {
    let total = 128 * 1024;
    let data = mp4_with_trailing_moov(total);
    let (_upstream, media_url) = spawn_upstream(data.clone()).await;

    let cache_root = tempfile::tempdir().unwrap();
    let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();
    let client = reqwest::Client::new();

    let (a, b) = tokio::join!(
        client
            .get(&proxy_url)
            .header(header::RANGE, "bytes=0-65535")
            .send(),
        client
            .get(&proxy_url)
            .header(header::RANGE, "bytes=65536-131071")
            .send(),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(b.status(), reqwest::StatusCode::PARTIAL_CONTENT);

    let (body_a, body_b) = tokio::join!(a.bytes(), b.bytes());
    assert_eq!(&body_a.unwrap()[..], &data[..65536]);
    assert_eq!(&body_b.unwrap()[..], &data[65536..]);
}

#[tokio::test]
async fn restart_recovers_cache_state_from_disk() {
    let total = 192 * 1024;
    let data = mp4_with_trailing_moov(total);
    let (upstream, media_url) = spawn_upstream(data.clone()).await;
    let cache_root = tempfile::tempdir().unwrap();

    // First process lifetime: full fetch.
    {
        let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
        let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();
        let body = reqwest::Client::new()
            .get(&proxy_url)
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], &data[..]);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let hits_before_restart = upstream.requests.load(Ordering::Relaxed);

    // Second process lifetime over the same cache root.
    let server = ProxyServer::new(cache_root.path(), test_config()).unwrap();
    let proxy_url = server.proxy_url(&media_url, &HashMap::new()).await.unwrap();
    let body = reqwest::Client::new()
        .get(&proxy_url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], &data[..]);

    assert_eq!(
        upstream.requests.load(Ordering::Relaxed),
        hits_before_restart,
        "a fully cached file must replay entirely from disk"
    );
}
