//! Segment downloader: fetches one segment with a ranged GET, resuming from
//! whatever a previous attempt left in the `.tmp` file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::segment::{Segment, SegmentStatus};

/// Flush-and-signal cadence, in body chunks.
const FLUSH_EVERY_CHUNKS: u64 = 10;

/// Events surfaced to the owning task so it can persist segment state.
#[derive(Debug, Clone, Copy)]
pub enum SegmentEvent {
    /// More bytes were appended to the current attempt.
    Progress,
    /// The segment status changed.
    Status(SegmentStatus),
}

/// Hook invoked on every segment event.
pub type UpdateHook = Arc<dyn Fn(SegmentEvent) + Send + Sync>;

pub struct SegmentDownloader {
    client: reqwest::Client,
    config: Arc<ProxyConfig>,
}

impl SegmentDownloader {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .tcp_nodelay(true)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    /// The shared upstream client, reused for probes.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Download one segment into `cache_dir`, retrying transient failures
    /// with exponential backoff.
    ///
    /// Returns `Ok(true)` when the segment is complete on disk, `Ok(false)`
    /// when cancelled. Disk-full and other non-retryable failures propagate
    /// immediately; the segment is left `Failed`.
    pub async fn download(
        &self,
        media_url: &str,
        segment: &Arc<Segment>,
        cache_dir: &Path,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
        on_update: Option<&UpdateHook>,
    ) -> Result<bool> {
        let mut delay = self.config.download_retry_initial_delay;
        let attempts = self.config.download_retry_count.max(1);

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                set_status(segment, SegmentStatus::Pending, on_update);
                return Ok(false);
            }

            match self
                .attempt(media_url, segment, cache_dir, headers, cancel, on_update)
                .await
            {
                Ok(completed) => return Ok(completed),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let sleep_for = jittered(delay);
                    warn!(
                        url = %media_url,
                        start = segment.start_byte(),
                        attempt = attempt + 1,
                        delay_ms = sleep_for.as_millis() as u64,
                        error = %e,
                        "Segment download failed, retrying"
                    );
                    delay *= 2;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            set_status(segment, SegmentStatus::Pending, on_update);
                            return Ok(false);
                        }
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
                Err(e) => {
                    set_status(segment, SegmentStatus::Failed, on_update);
                    return Err(e);
                }
            }
        }

        Err(ProxyError::internal("retry loop exited without result"))
    }

    async fn attempt(
        &self,
        media_url: &str,
        segment: &Arc<Segment>,
        cache_dir: &Path,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
        on_update: Option<&UpdateHook>,
    ) -> Result<bool> {
        let final_path = segment.final_path(cache_dir);
        let temp_path = segment.temp_path(cache_dir);
        let expected = segment.expected_size();

        // Already on disk from an earlier run or a racing downloader.
        if segment.is_completed() || file_len(&final_path).await >= expected {
            let _ = tokio::fs::remove_file(&temp_path).await;
            set_status(segment, SegmentStatus::Completed, on_update);
            return Ok(true);
        }

        // Resume point left by a previous attempt.
        let mut existing = file_len(&temp_path).await;
        if existing > expected {
            tokio::fs::remove_file(&temp_path)
                .await
                .map_err(|e| ProxyError::io("removing oversized temp", &temp_path, e))?;
            existing = 0;
        }
        if existing >= expected {
            self.finalize(segment, &final_path, &temp_path).await?;
            set_status(segment, SegmentStatus::Completed, on_update);
            return Ok(true);
        }

        let range_start = segment.start_byte() + existing;
        let response = self
            .client
            .get(media_url)
            .headers(upstream_headers(headers))
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range_start, segment.end_byte()),
            )
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(ProxyError::http_status(status, media_url, "segment GET"));
        }
        if status == StatusCode::OK && range_start > 0 {
            // Upstream ignored the Range header; its body restarts at byte 0
            // and cannot be appended to a mid-file segment.
            warn!(url = %media_url, start = range_start, "Upstream does not support range requests");
            return Err(ProxyError::http_status(status, media_url, "ranged segment GET"));
        }

        set_status(segment, SegmentStatus::Downloading, on_update);
        segment.set_downloaded_bytes(existing);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp_path)
            .await
            .map_err(|e| ProxyError::io("opening segment temp", &temp_path, e))?;

        let mut stream = response.bytes_stream();
        let mut written = existing;
        let mut chunks: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                let _ = file.flush().await;
                set_status(segment, SegmentStatus::Pending, on_update);
                debug!(url = %media_url, start = segment.start_byte(), "Segment download cancelled");
                return Ok(false);
            }

            let next = tokio::time::timeout(self.config.stream_read_timeout, stream.next())
                .await
                .map_err(|_| ProxyError::Timeout {
                    reason: format!(
                        "no body data for {}s at byte {}",
                        self.config.stream_read_timeout.as_secs(),
                        written
                    ),
                })?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            // Never write past the segment boundary; a 200 response for the
            // first segment carries the whole file.
            let take = ((expected - written).min(chunk.len() as u64)) as usize;
            file.write_all(&chunk[..take])
                .await
                .map_err(|e| ProxyError::io("writing segment data", &temp_path, e))?;
            written += take as u64;
            segment.set_downloaded_bytes(written);
            emit(on_update, SegmentEvent::Progress);

            chunks += 1;
            if chunks.is_multiple_of(FLUSH_EVERY_CHUNKS) {
                file.flush()
                    .await
                    .map_err(|e| ProxyError::io("flushing segment data", &temp_path, e))?;
                segment.notify_data_available();
            }

            if written >= expected {
                break;
            }
        }

        file.flush()
            .await
            .map_err(|e| ProxyError::io("flushing segment data", &temp_path, e))?;
        drop(file);
        segment.notify_data_available();

        if written < expected {
            return Err(ProxyError::IncompleteSegment { written, expected });
        }

        self.finalize(segment, &final_path, &temp_path).await?;
        set_status(segment, SegmentStatus::Completed, on_update);
        debug!(url = %media_url, start = segment.start_byte(), bytes = written, "Segment completed");
        Ok(true)
    }

    /// Commit the temp file. When a racing downloader already produced the
    /// final file, our temp is redundant and is discarded instead.
    async fn finalize(&self, segment: &Segment, final_path: &Path, temp_path: &Path) -> Result<()> {
        if file_len(final_path).await >= segment.expected_size() {
            let _ = tokio::fs::remove_file(temp_path).await;
            return Ok(());
        }
        tokio::fs::rename(temp_path, final_path)
            .await
            .map_err(|e| ProxyError::io("committing segment", final_path, e))
    }
}

fn set_status(segment: &Segment, status: SegmentStatus, on_update: Option<&UpdateHook>) {
    segment.set_status(status);
    emit(on_update, SegmentEvent::Status(status));
}

fn emit(on_update: Option<&UpdateHook>, event: SegmentEvent) {
    if let Some(hook) = on_update {
        hook(event);
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter_cap = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::rng().random_range(0..jitter_cap))
}

/// Convert caller-supplied headers, dropping hop-by-hop fields and anything
/// that does not parse as a header.
pub(crate) fn upstream_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "connection" || lower == "range" {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid upstream header"),
        }
    }
    map
}

async fn file_len(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}
