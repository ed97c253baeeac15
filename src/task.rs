//! Per-media download task: identity, segment layout, on-disk persistence,
//! probing, and the `moov` prefetch policy.
//!
//! A task owns one cache directory named by the MD5 of its identity. The
//! directory holds `config.json` plus the per-segment `.seg`/`.tmp` files.
//! Tasks live in memory while sessions reference them and are flushed and
//! dropped afterwards; the cache files stay behind for the next request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, priority};
use crate::downloader::{SegmentEvent, UpdateHook, upstream_headers};
use crate::error::{ProxyError, Result};
use crate::mime;
use crate::mp4::{MoovPosition, detect_moov_position};
use crate::queue::{DownloadQueue, QueueItem};
use crate::segment::{Segment, SegmentStatus, parse_segment_stem};

pub const CONFIG_FILE_NAME: &str = "config.json";

/// `config.json` schema. Field names are stable; `status` is the integer
/// code of [`SegmentStatus`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTask {
    content_length: i64,
    content_type: String,
    last_access_time: i64,
    request_headers: Option<HashMap<String, String>>,
    segments: Vec<PersistedSegment>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSegment {
    start_byte: u64,
    end_byte: u64,
    status: u8,
    downloaded_bytes: u64,
    last_update_time: i64,
}

struct TaskState {
    /// Total media size; -1 until probed.
    content_length: i64,
    content_type: String,
    /// Ordered by `start_byte`, disjoint, contiguous over `[0, len-1]`.
    segments: Vec<Arc<Segment>>,
    moov_position: MoovPosition,
    moov_preload_requested: bool,
    last_access_ms: i64,
    /// Leading bytes captured by the probe fallback, consumed by detection.
    leading_bytes: Option<Vec<u8>>,
}

pub struct DownloadTask {
    media_url: String,
    headers: HashMap<String, String>,
    cache_dir: PathBuf,
    config: Arc<ProxyConfig>,
    queue: Arc<DownloadQueue>,
    client: reqwest::Client,
    state: Mutex<TaskState>,
    sessions: AtomicUsize,
    dirty: AtomicBool,
    save_scheduled: AtomicBool,
    cancel: CancellationToken,
}

impl DownloadTask {
    /// Canonical identity: the URL alone, or `url|k1=v1&k2=v2` with headers
    /// sorted by name. Registry keys and directory hashes both use this.
    pub fn identity(media_url: &str, headers: &HashMap<String, String>) -> String {
        if headers.is_empty() {
            return media_url.to_string();
        }
        let mut pairs: Vec<_> = headers.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let joined: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}|{}", media_url, joined.join("&"))
    }

    /// Cache directory name for an identity.
    pub fn dir_hash(media_url: &str, headers: &HashMap<String, String>) -> String {
        let mut hasher = Md5::new();
        hasher.update(Self::identity(media_url, headers).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn new(
        media_url: impl Into<String>,
        headers: HashMap<String, String>,
        cache_root: &Path,
        config: Arc<ProxyConfig>,
        queue: Arc<DownloadQueue>,
        client: reqwest::Client,
    ) -> Arc<Self> {
        let media_url = media_url.into();
        let cache_dir = cache_root.join(Self::dir_hash(&media_url, &headers));
        Arc::new(Self {
            media_url,
            headers,
            cache_dir,
            config,
            queue,
            client,
            state: Mutex::new(TaskState {
                content_length: -1,
                content_type: String::new(),
                segments: Vec::new(),
                moov_position: MoovPosition::Unknown,
                moov_preload_requested: false,
                last_access_ms: chrono::Utc::now().timestamp_millis(),
                leading_bytes: None,
            }),
            sessions: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            save_scheduled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Bring the task to a servable state: load persisted config, reconcile
    /// with on-disk files, probe the upstream if the length is unknown,
    /// detect the `moov` position for MP4, and lay out segments.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| ProxyError::io("creating cache directory", &self.cache_dir, e))?;

        self.load_persisted().await;
        self.scan_disk().await?;

        if self.content_length() <= 0 {
            self.probe().await?;
        }

        self.detect_moov_if_needed().await;

        {
            let mut state = self.state.lock();
            if state.content_length > 0 {
                let layout = self.layout_segments(state.content_length as u64);
                if state.segments.is_empty() {
                    state.segments = layout;
                } else {
                    // A partial scan (crash without a config) may have
                    // rebuilt only some segments; fill the gaps so coverage
                    // of [0, len-1] stays contiguous.
                    for segment in layout {
                        let covered = state
                            .segments
                            .iter()
                            .any(|s| s.overlaps(segment.start_byte(), segment.end_byte()));
                        if !covered {
                            state.segments.push(segment);
                        }
                    }
                    state.segments.sort_by_key(|s| s.start_byte());
                }
            }
            state.last_access_ms = chrono::Utc::now().timestamp_millis();
        }

        self.flush().await?;
        debug!(
            url = %self.media_url,
            length = self.content_length(),
            segments = self.segment_count(),
            "Task initialized"
        );
        Ok(())
    }

    async fn load_persisted(&self) {
        let path = self.config_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let persisted: PersistedTask = match serde_json::from_slice(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt task config");
                let _ = tokio::fs::remove_file(&path).await;
                return;
            }
        };

        let mut state = self.state.lock();
        state.content_length = persisted.content_length;
        state.content_type = persisted.content_type;
        state.last_access_ms = persisted.last_access_time;
        state.segments = persisted
            .segments
            .iter()
            .map(|s| {
                // A persisted `Downloading` is a download the previous
                // process never finished; it restarts as `Pending`.
                Arc::new(Segment::with_state(
                    s.start_byte,
                    s.end_byte,
                    SegmentStatus::from_code(s.status),
                    s.downloaded_bytes,
                ))
            })
            .collect();
        state.segments.sort_by_key(|s| s.start_byte());
    }

    /// Reconcile segment statuses with the files actually on disk. A final
    /// file shorter than its range means a corrupt commit; the segment goes
    /// back to `Pending`. `.tmp` lengths become the resume offsets.
    async fn scan_disk(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| ProxyError::io("scanning cache directory", &self.cache_dir, e))?;

        let mut seen: Vec<(u64, u64, bool, u64)> = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ProxyError::io("scanning cache directory", &self.cache_dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let (stem, is_final) = match name.strip_suffix(".seg") {
                Some(stem) => (stem, true),
                None => match name.strip_suffix(".tmp") {
                    Some(stem) => (stem, false),
                    None => continue,
                },
            };
            let Some((start, end)) = parse_segment_stem(stem) else {
                continue;
            };
            let len = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            seen.push((start, end, is_final, len));
        }

        let mut state = self.state.lock();
        let mut backed: Vec<u64> = Vec::new();
        for (start, end, is_final, len) in seen {
            let expected = end - start + 1;
            if is_final && len >= expected {
                backed.push(start);
            }
            let segment = match state
                .segments
                .iter()
                .find(|s| s.start_byte() == start && s.end_byte() == end)
            {
                Some(existing) => Arc::clone(existing),
                None => {
                    let created = Arc::new(Segment::new(start, end));
                    state.segments.push(Arc::clone(&created));
                    created
                }
            };

            if is_final {
                if len >= expected {
                    segment.set_status(SegmentStatus::Completed);
                } else {
                    warn!(
                        url = %self.media_url,
                        start,
                        end,
                        len,
                        "Final segment file is short, re-downloading"
                    );
                    segment.set_status(SegmentStatus::Pending);
                    segment.set_downloaded_bytes(0);
                }
            } else if !segment.is_completed() {
                segment.set_status(SegmentStatus::Pending);
                segment.set_downloaded_bytes(len.min(expected));
            }
        }

        // Statuses come from the files, not the other way around: a segment
        // the config believed complete needs a valid final file to stay so.
        for segment in &state.segments {
            if segment.is_completed() && !backed.contains(&segment.start_byte()) {
                segment.set_status(SegmentStatus::Pending);
                segment.set_downloaded_bytes(0);
            }
        }
        state.segments.sort_by_key(|s| s.start_byte());
        Ok(())
    }

    /// Probe the upstream for length and content type. HEAD first; servers
    /// that refuse HEAD get a small ranged GET whose `Content-Range` total
    /// carries the length and whose body seeds `moov` detection.
    async fn probe(&self) -> Result<()> {
        let head = self
            .client
            .head(&self.media_url)
            .headers(upstream_headers(&self.headers))
            .send()
            .await;

        if let Ok(response) = head
            && response.status().is_success()
        {
            // HEAD bodies are empty, so the typed length accessor reports 0;
            // read the header itself.
            let length = header_content_length(response.headers());
            let content_type = header_str(response.headers(), reqwest::header::CONTENT_TYPE);
            if let Some(length) = length {
                let mut state = self.state.lock();
                state.content_length = length as i64;
                if let Some(ct) = content_type {
                    state.content_type = mime::normalize_content_type(&ct);
                }
                return Ok(());
            }
        }

        // Ranged fallback.
        let probe_bytes = self.config.moov_detection_bytes.max(1);
        let response = self
            .client
            .get(&self.media_url)
            .headers(upstream_headers(&self.headers))
            .header(
                reqwest::header::RANGE,
                format!("bytes=0-{}", probe_bytes - 1),
            )
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::http_status(
                status,
                &self.media_url,
                "length probe",
            ));
        }

        let total = header_str(response.headers(), reqwest::header::CONTENT_RANGE)
            .as_deref()
            .and_then(parse_content_range_total)
            .or_else(|| {
                // A plain 200 ignores the range; its Content-Length is the
                // full size.
                (status == reqwest::StatusCode::OK)
                    .then(|| header_content_length(response.headers()))
                    .flatten()
            })
            .filter(|len| *len > 0)
            .ok_or_else(|| ProxyError::UnknownLength {
                url: self.media_url.clone(),
            })?;
        let content_type = header_str(response.headers(), reqwest::header::CONTENT_TYPE);

        let leading = read_leading_bytes(response, probe_bytes as usize).await?;

        let mut state = self.state.lock();
        state.content_length = total as i64;
        if let Some(ct) = content_type {
            state.content_type = mime::normalize_content_type(&ct);
        }
        state.leading_bytes = Some(leading);
        Ok(())
    }

    async fn detect_moov_if_needed(&self) {
        let (length, captured) = {
            let mut state = self.state.lock();
            if state.moov_position != MoovPosition::Unknown || state.content_length <= 0 {
                return;
            }
            if !mime::is_mp4(&state.content_type, &self.media_url) {
                return;
            }
            (state.content_length as u64, state.leading_bytes.take())
        };

        // Small files start playing immediately either way; skip the probe
        // and assume fast-start.
        if length < self.config.skip_moov_detection_threshold {
            self.state.lock().moov_position = MoovPosition::AtStart;
            return;
        }

        let cached = match captured {
            Some(bytes) => Some(bytes),
            None => self.leading_bytes_from_cache().await,
        };
        let leading = match cached {
            Some(bytes) => bytes,
            None => match self.fetch_leading_bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(url = %self.media_url, error = %e, "moov probe failed, assuming tail placement");
                    self.state.lock().moov_position = MoovPosition::AtEnd;
                    return;
                }
            },
        };

        let position = detect_moov_position(&leading);
        info!(url = %self.media_url, ?position, "moov position detected");
        self.state.lock().moov_position = position;
    }

    /// When the file head is already cached, the detector can read it from
    /// disk instead of the network.
    async fn leading_bytes_from_cache(&self) -> Option<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let first = self.state.lock().segments.first().cloned()?;
        if first.start_byte() != 0 || !first.is_completed() {
            return None;
        }
        let mut file = tokio::fs::File::open(first.final_path(&self.cache_dir))
            .await
            .ok()?;
        let mut buf = vec![0u8; self.config.moov_detection_bytes as usize];
        file.read_exact(&mut buf).await.ok()?;
        Some(buf)
    }

    async fn fetch_leading_bytes(&self) -> Result<Vec<u8>> {
        let probe_bytes = self.config.moov_detection_bytes.max(1);
        let response = self
            .client
            .get(&self.media_url)
            .headers(upstream_headers(&self.headers))
            .header(
                reqwest::header::RANGE,
                format!("bytes=0-{}", probe_bytes - 1),
            )
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::http_status(status, &self.media_url, "moov probe"));
        }
        read_leading_bytes(response, probe_bytes as usize).await
    }

    fn layout_segments(&self, content_length: u64) -> Vec<Arc<Segment>> {
        let segment_size = self.config.segment_size_for(content_length);
        let mut segments = Vec::with_capacity(content_length.div_ceil(segment_size) as usize);
        let mut start = 0u64;
        while start < content_length {
            let end = (start + segment_size - 1).min(content_length - 1);
            segments.push(Arc::new(Segment::new(start, end)));
            start = end + 1;
        }
        segments
    }

    /// Ordered segments overlapping `[range_start, range_end]`. When the
    /// length is known but nothing overlaps (layout was lost), the covering
    /// segments are created lazily on size-aligned boundaries.
    pub fn segments_for_range(&self, range_start: u64, range_end: u64) -> Vec<Arc<Segment>> {
        let mut state = self.state.lock();
        if state.content_length <= 0 {
            return Vec::new();
        }
        let length = state.content_length as u64;
        let range_end = range_end.min(length - 1);
        if range_start > range_end {
            return Vec::new();
        }

        let overlapping: Vec<Arc<Segment>> = state
            .segments
            .iter()
            .filter(|s| s.overlaps(range_start, range_end))
            .cloned()
            .collect();
        if !overlapping.is_empty() {
            return overlapping;
        }

        let segment_size = self.config.segment_size_for(length);
        let mut start = (range_start / segment_size) * segment_size;
        while start <= range_end {
            let end = (start + segment_size - 1).min(length - 1);
            if !state.segments.iter().any(|s| s.start_byte() == start) {
                state.segments.push(Arc::new(Segment::new(start, end)));
            }
            start = end + 1;
        }
        state.segments.sort_by_key(|s| s.start_byte());

        state
            .segments
            .iter()
            .filter(|s| s.overlaps(range_start, range_end))
            .cloned()
            .collect()
    }

    /// Mutate a segment's status on behalf of a serving loop, persisting
    /// terminal transitions immediately and debouncing the rest.
    pub fn update_segment_status(
        self: &Arc<Self>,
        segment: &Segment,
        status: SegmentStatus,
        downloaded_bytes: Option<u64>,
    ) {
        if let Some(bytes) = downloaded_bytes {
            segment.set_downloaded_bytes(bytes);
        }
        segment.set_status(status);
        if status.is_terminal() {
            self.flush_soon();
        } else {
            self.mark_dirty();
        }
    }

    /// Idempotently enqueue the tail segment for an MP4 whose `moov` atom
    /// trails the media data. The latch resets only when the download fails,
    /// so a later request may retry.
    pub fn preload_moov_segment(self: &Arc<Self>) {
        let segment = {
            let mut state = self.state.lock();
            if state.moov_preload_requested {
                return;
            }
            if state.moov_position != MoovPosition::AtEnd {
                return;
            }
            let Some(last) = state.segments.last() else {
                return;
            };
            if matches!(
                last.status(),
                SegmentStatus::Completed | SegmentStatus::Downloading
            ) {
                return;
            }
            let last = Arc::clone(last);
            state.moov_preload_requested = true;
            last
        };

        info!(url = %self.media_url, start = segment.start_byte(), "Preloading tail segment for moov");
        let rx = self
            .queue
            .enqueue(self.queue_item(&segment, priority::TAIL));

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Ok(false) = rx.await
                && let Some(task) = weak.upgrade()
            {
                task.state.lock().moov_preload_requested = false;
            }
        });
    }

    /// Build a queue item for one of this task's segments, carrying the
    /// persistence hook and the task's cancellation scope.
    pub fn queue_item(self: &Arc<Self>, segment: &Arc<Segment>, priority_value: u32) -> QueueItem {
        QueueItem::new(
            self.media_url.clone(),
            segment,
            self.cache_dir.clone(),
            self.headers.clone(),
            priority_value,
            &self.cancel,
            Some(self.update_hook()),
        )
    }

    fn update_hook(self: &Arc<Self>) -> UpdateHook {
        let weak = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(task) = weak.upgrade() else { return };
            match event {
                SegmentEvent::Progress => task.mark_dirty(),
                SegmentEvent::Status(status) if status.is_terminal() => task.flush_soon(),
                SegmentEvent::Status(_) => task.mark_dirty(),
            }
        })
    }

    /// Schedule a debounced save. Terminal transitions use
    /// [`DownloadTask::flush_soon`] instead so an abrupt exit cannot lose
    /// them.
    pub fn mark_dirty(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        if self.save_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(task.config.config_save_interval).await;
            task.save_scheduled.store(false, Ordering::Release);
            if task.dirty.swap(false, Ordering::AcqRel)
                && let Err(e) = task.flush().await
            {
                warn!(url = %task.media_url, error = %e, "Debounced config save failed");
            }
        });
    }

    fn flush_soon(self: &Arc<Self>) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = task.flush().await {
                warn!(url = %task.media_url, error = %e, "Config flush failed");
            }
        });
    }

    /// Write `config.json` for the current state.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock();
            PersistedTask {
                content_length: state.content_length,
                content_type: state.content_type.clone(),
                last_access_time: state.last_access_ms,
                request_headers: (!self.headers.is_empty()).then(|| self.headers.clone()),
                segments: state
                    .segments
                    .iter()
                    .map(|s| PersistedSegment {
                        start_byte: s.start_byte(),
                        end_byte: s.end_byte(),
                        status: s.status().code(),
                        downloaded_bytes: s.downloaded_bytes(),
                        last_update_time: s.last_update_ms(),
                    })
                    .collect(),
            }
        };
        let path = self.config_path();
        let raw = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| ProxyError::io("writing task config", &path, e))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn add_session(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn remove_session(&self) {
        self.sessions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.state.lock().last_access_ms = chrono::Utc::now().timestamp_millis();
        self.dirty.store(true, Ordering::Release);
    }

    /// Cancel all of this task's downloads and wake every waiter so serving
    /// loops can observe the shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel();
        for segment in self.state.lock().segments.iter() {
            segment.notify_data_available();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn media_url(&self) -> &str {
        &self.media_url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn config_path(&self) -> PathBuf {
        self.cache_dir.join(CONFIG_FILE_NAME)
    }

    pub fn content_length(&self) -> i64 {
        self.state.lock().content_length
    }

    pub fn content_type(&self) -> String {
        self.state.lock().content_type.clone()
    }

    pub fn moov_position(&self) -> MoovPosition {
        self.state.lock().moov_position
    }

    pub fn is_mp4(&self) -> bool {
        mime::is_mp4(&self.content_type(), &self.media_url)
    }

    pub fn last_access_ms(&self) -> i64 {
        self.state.lock().last_access_ms
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn last_segment(&self) -> Option<Arc<Segment>> {
        self.state.lock().segments.last().cloned()
    }

    pub fn has_completed_segment(&self) -> bool {
        self.state
            .lock()
            .segments
            .iter()
            .any(|s| s.is_completed())
    }

    #[cfg(test)]
    pub(crate) fn set_probe_result(&self, content_length: i64, content_type: &str) {
        let mut state = self.state.lock();
        state.content_length = content_length;
        state.content_type = content_type.to_string();
    }
}

fn header_content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    header_str(headers, reqwest::header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

fn header_str(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size out of a `Content-Range: bytes 0-63/12345` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Drain up to `limit` bytes from a response body.
async fn read_leading_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    use futures::StreamExt;

    let mut out = Vec::with_capacity(limit);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let take = (limit - out.len()).min(chunk.len());
        out.extend_from_slice(&chunk[..take]);
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}
