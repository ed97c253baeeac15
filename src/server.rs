//! Loopback proxy server.
//!
//! One persistent IPv4 listener on an ephemeral port. A media player is
//! pointed at `/media?url=<urlEncoded>[&headers=<base64url(json)>]` and gets
//! `206 Partial Content` responses backed by the segment cache, while the
//! queue keeps prefetching around the playback position.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{OnceCell, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::downloader::SegmentDownloader;
use crate::error::{ProxyError, Result};
use crate::manager::DownloadManager;
use crate::mp4::MoovPosition;
use crate::queue::DownloadQueue;
use crate::session::PlayerSession;

#[derive(Clone)]
struct ProxyState {
    manager: Arc<DownloadManager>,
    queue: Arc<DownloadQueue>,
    config: Arc<ProxyConfig>,
    next_session_id: Arc<AtomicU64>,
}

pub struct ProxyServer {
    state: ProxyState,
    started: OnceCell<SocketAddr>,
}

impl ProxyServer {
    /// Build a proxy over `cache_root`. Wires the downloader, queue, and
    /// manager together, including the disk-full emergency eviction hook.
    pub fn new(cache_root: impl Into<std::path::PathBuf>, config: ProxyConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let downloader = Arc::new(SegmentDownloader::new(Arc::clone(&config))?);
        let queue = DownloadQueue::new(Arc::clone(&config), Arc::clone(&downloader));
        let manager = DownloadManager::new(
            cache_root,
            Arc::clone(&config),
            Arc::clone(&queue),
            downloader,
        );

        {
            let manager = Arc::clone(&manager);
            queue.set_disk_full_handler(Box::new(move || {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.emergency_cleanup().await });
            }));
        }

        Ok(Arc::new(Self {
            state: ProxyState {
                manager,
                queue,
                config,
                next_session_id: Arc::new(AtomicU64::new(1)),
            },
            started: OnceCell::new(),
        }))
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.state.manager
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.state.queue
    }

    /// Start the listener if needed and return the base URL. Single-flight:
    /// concurrent callers all get the same `http://127.0.0.1:<port>`.
    pub async fn start(&self) -> Result<String> {
        let addr = self
            .started
            .get_or_try_init(|| async {
                let listener = TcpListener::bind(("127.0.0.1", 0))
                    .await
                    .map_err(|e| ProxyError::io("binding proxy listener", Path::new("127.0.0.1:0"), e))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| ProxyError::io("reading listener address", Path::new("127.0.0.1:0"), e))?;

                let app = router(self.state.clone());
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!(error = %e, "Proxy server exited");
                    }
                });

                info!(%addr, "Proxy server listening");
                Ok::<_, ProxyError>(addr)
            })
            .await?;
        Ok(format!("http://{addr}"))
    }

    /// Player-facing URL for a media object, starting the server on first
    /// use.
    pub async fn proxy_url(
        &self,
        media_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String> {
        let base = self.start().await?;
        build_proxy_url(&base, media_url, headers)
    }
}

fn build_proxy_url(
    base: &str,
    media_url: &str,
    headers: &HashMap<String, String>,
) -> Result<String> {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("url", media_url);
    if !headers.is_empty() {
        let json = serde_json::to_string(headers)?;
        query.append_pair("headers", &URL_SAFE_NO_PAD.encode(json));
    }
    Ok(format!("{base}/media?{}", query.finish()))
}

fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/media", get(serve_media))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    headers: Option<String>,
}

type HandlerError = (StatusCode, String);

async fn serve_media(
    State(state): State<ProxyState>,
    Query(query): Query<MediaQuery>,
    request_headers: HeaderMap,
) -> Response {
    match handle_media(state, query, request_headers).await {
        Ok(response) => response,
        Err((status, message)) => (status, message).into_response(),
    }
}

async fn handle_media(
    state: ProxyState,
    query: MediaQuery,
    request_headers: HeaderMap,
) -> std::result::Result<Response, HandlerError> {
    let Some(media_url) = query.url else {
        return Err((StatusCode::BAD_REQUEST, "missing url parameter".into()));
    };
    let headers = match query.headers.as_deref() {
        Some(raw) => decode_headers(raw)
            .map_err(|reason| (StatusCode::BAD_REQUEST, format!("invalid headers: {reason}")))?,
        None => HashMap::new(),
    };

    let task = state
        .manager
        .get_or_create_task(&media_url, headers.clone())
        .await
        .map_err(|e| {
            warn!(url = %media_url, error = %e, "Task acquisition failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    task.add_session();

    match begin_stream(&state, &task, &media_url, &headers, &request_headers).await {
        Ok(response) => Ok(response),
        Err(e) => {
            // The streaming task never started; tear the session down here.
            task.remove_session();
            state
                .manager
                .remove_task_if_inactive(&media_url, &headers)
                .await;
            Err(e)
        }
    }
}

async fn begin_stream(
    state: &ProxyState,
    task: &Arc<crate::task::DownloadTask>,
    media_url: &str,
    headers: &HashMap<String, String>,
    request_headers: &HeaderMap,
) -> std::result::Result<Response, HandlerError> {
    let content_length = task.content_length();
    if content_length <= 0 {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream content length unknown".into(),
        ));
    }
    let total = content_length as u64;

    let range_header = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let (start, end) = parse_range(range_header, total)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // A fresh playback of a tail-moov MP4 will need the file end almost
    // immediately; start fetching it now.
    if start == 0 && task.is_mp4() && task.moov_position() == MoovPosition::AtEnd {
        task.preload_moov_segment();
    }

    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let session = Arc::new(PlayerSession::new(
        session_id,
        Arc::clone(task),
        Arc::clone(&state.queue),
        Arc::clone(&state.config),
        start,
        end,
    ));
    session.start_downloads();

    let (tx, rx) = mpsc::channel::<std::io::Result<bytes::Bytes>>(8);
    {
        let manager = Arc::clone(&state.manager);
        let task = Arc::clone(task);
        let media_url = media_url.to_string();
        let headers = headers.clone();
        tokio::spawn(async move {
            session.stream(tx).await;
            task.remove_session();
            manager.remove_task_if_inactive(&media_url, &headers).await;
        });
    }

    let content_type = {
        let ct = task.content_type();
        if ct.is_empty() {
            crate::mime::mime_for_url(media_url)
                .unwrap_or("application/octet-stream")
                .to_string()
        } else {
            ct
        }
    };

    let response = Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        )
        .header(header::CONTENT_LENGTH, end - start + 1)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(response)
}

/// Decode the `headers` query parameter: base64url (padded or not) wrapping a
/// JSON string map.
fn decode_headers(raw: &str) -> std::result::Result<HashMap<String, String>, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw)
        .or_else(|_| URL_SAFE.decode(raw))
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Parse `Range: bytes=S-[E]`, defaulting to the full object and clamping to
/// `[0, total-1]`. Suffix ranges (`bytes=-N`) resolve to the last N bytes.
fn parse_range(raw: Option<&str>, total: u64) -> Result<(u64, u64)> {
    debug_assert!(total > 0);
    let Some(raw) = raw else {
        return Ok((0, total - 1));
    };
    let invalid = |reason: &str| ProxyError::InvalidRange {
        input: raw.to_string(),
        reason: reason.to_string(),
    };

    let ranges = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| invalid("unsupported unit"))?;
    // Multi-range requests are answered with the first range only.
    let first = ranges.split(',').next().unwrap_or(ranges).trim();

    let (start_str, end_str) = first
        .split_once('-')
        .ok_or_else(|| invalid("missing dash"))?;

    if start_str.is_empty() {
        // Suffix form: last N bytes.
        let n: u64 = end_str.parse().map_err(|_| invalid("bad suffix length"))?;
        if n == 0 {
            return Err(invalid("empty suffix"));
        }
        return Ok((total.saturating_sub(n), total - 1));
    }

    let start: u64 = start_str.parse().map_err(|_| invalid("bad start"))?;
    let end: u64 = if end_str.is_empty() {
        total - 1
    } else {
        end_str.parse().map_err(|_| invalid("bad end"))?
    };

    let start = start.min(total - 1);
    let end = end.min(total - 1);
    if start > end {
        return Err(invalid("inverted range"));
    }
    Ok((start, end))
}
