//! Player session: one HTTP request's serving context.
//!
//! A session kicks off the downloads its range needs, then streams bytes in
//! ascending order, reading each segment's `.seg` (preferred) or growing
//! `.tmp` file and waiting on the segment's data-available signal whenever
//! the downloader has not caught up yet.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ProxyConfig, priority};
use crate::queue::DownloadQueue;
use crate::segment::{Segment, SegmentStatus};
use crate::task::DownloadTask;

/// Bytes read from a segment file per response write.
const READ_CHUNK: usize = 64 * 1024;

pub struct PlayerSession {
    session_id: u64,
    task: Arc<DownloadTask>,
    queue: Arc<DownloadQueue>,
    config: Arc<ProxyConfig>,
    range_start: u64,
    range_end: u64,
    closed: AtomicBool,
}

impl PlayerSession {
    pub fn new(
        session_id: u64,
        task: Arc<DownloadTask>,
        queue: Arc<DownloadQueue>,
        config: Arc<ProxyConfig>,
        range_start: u64,
        range_end: u64,
    ) -> Self {
        Self {
            session_id,
            task,
            queue,
            config,
            range_start,
            range_end,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue the downloads this session needs.
    ///
    /// Candidates are the requested segments plus tail insurance (the last
    /// segment carries the `moov` atom for most MP4s) and a small prefetch
    /// window past the requested range. On a cold start only the critical
    /// pair (nearest segment + tail) is enqueued so all bandwidth goes to
    /// getting playback started.
    pub fn start_downloads(self: &Arc<Self>) {
        let url = self.task.media_url().to_string();
        let content_length = self.task.content_length();
        if content_length <= 0 {
            return;
        }
        let content_length = content_length as u64;

        self.queue.set_current_playing(&url);

        let requested = self.task.segments_for_range(self.range_start, self.range_end);
        let mut candidates: Vec<Arc<Segment>> = Vec::new();
        let push = |segment: &Arc<Segment>, out: &mut Vec<Arc<Segment>>| {
            if segment.can_start_download()
                && !out.iter().any(|s| s.start_byte() == segment.start_byte())
            {
                out.push(Arc::clone(segment));
            }
        };

        for segment in &requested {
            push(segment, &mut candidates);
        }
        if let Some(last) = self.task.last_segment() {
            push(&last, &mut candidates);
        }

        // Aggressive prefetch window beyond the requested range.
        if let Some(last_requested) = requested.last() {
            let window_start = last_requested.end_byte() + 1;
            if window_start < content_length {
                let window = self.config.prefetch_window_segments
                    * self.config.segment_size_for(content_length);
                let window_end = (window_start + window.saturating_sub(1)).min(content_length - 1);
                for segment in self.task.segments_for_range(window_start, window_end) {
                    push(&segment, &mut candidates);
                }
            }
        }

        candidates.sort_by_key(|s| s.start_byte().abs_diff(self.range_start));

        let cold_start = !self.task.has_completed_segment();
        for (index, segment) in candidates.iter().enumerate() {
            let is_first_playback = index == 0;
            let is_tail = segment.end_byte() + 1 >= content_length;
            if cold_start && !is_first_playback && !is_tail {
                // Startup-thrift: nothing cached yet, spend all bandwidth on
                // what the player needs to begin decoding.
                continue;
            }

            let priority_value = if is_first_playback {
                priority::PLAYING_URGENT
            } else if is_tail {
                priority::TAIL
            } else {
                priority::PLAYING
            };

            let rx = self
                .queue
                .enqueue(self.task.queue_item(segment, priority_value));

            if is_first_playback {
                // Hold the startup lock until the first segment resolves.
                self.queue.update_startup_lock(&url, 1);
                let queue = Arc::clone(&self.queue);
                let url = url.clone();
                tokio::spawn(async move {
                    let _ = rx.await;
                    queue.update_startup_lock(&url, -1);
                });
            }
        }
    }

    /// Stream `[range_start, range_end]` into `tx` in strict byte order.
    /// Returns the number of bytes sent.
    pub async fn stream(self: Arc<Self>, tx: mpsc::Sender<std::io::Result<Bytes>>) -> u64 {
        let segments = self.task.segments_for_range(self.range_start, self.range_end);
        let mut pos = self.range_start;
        let mut sent = 0u64;

        for segment in segments {
            if pos > self.range_end {
                break;
            }
            let read_start = segment.start_byte().max(pos);
            let read_end = segment.end_byte().min(self.range_end);
            if read_start > read_end {
                continue;
            }
            match self.stream_segment(&segment, read_start, read_end, &tx).await {
                Some(bytes) => sent += bytes,
                None => break,
            }
            pos = read_end + 1;
        }

        debug!(
            session = self.session_id,
            start = self.range_start,
            end = self.range_end,
            sent,
            "Session stream finished"
        );
        sent
    }

    /// Stream one segment's `[read_start, read_end]` slice. Returns the byte
    /// count on success, `None` when the session must stop (client gone,
    /// task cancelled, or the segment is unrecoverable).
    async fn stream_segment(
        &self,
        segment: &Arc<Segment>,
        read_start: u64,
        read_end: u64,
        tx: &mpsc::Sender<std::io::Result<Bytes>>,
    ) -> Option<u64> {
        let bytes_to_read = read_end - read_start + 1;
        let offset = read_start - segment.start_byte();
        let mut written = 0u64;
        let mut redownloads = 0u32;

        loop {
            if self.closed.load(Ordering::Acquire) || self.task.is_cancelled() {
                return None;
            }

            let expect_file = segment.is_completed() || segment.downloaded_bytes() > 0;
            if let Some((mut file, file_len)) = self.open_segment_file(segment, expect_file).await {
                let available = file_len.saturating_sub(offset + written);
                if available > 0 {
                    let mut to_send = available.min(bytes_to_read - written);
                    if let Err(e) = file.seek(SeekFrom::Start(offset + written)).await {
                        warn!(session = self.session_id, error = %e, "Segment seek failed");
                        segment.wait_for_data(self.config.serve_poll_interval).await;
                        continue;
                    }

                    let mut read_failed = false;
                    while to_send > 0 {
                        let n = (READ_CHUNK as u64).min(to_send) as usize;
                        let mut buf = vec![0u8; n];
                        if let Err(e) = file.read_exact(&mut buf).await {
                            warn!(session = self.session_id, error = %e, "Segment read failed");
                            read_failed = true;
                            break;
                        }
                        if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                            // Client went away; downloads already in flight
                            // keep running for the next request.
                            debug!(session = self.session_id, "Client disconnected");
                            self.closed.store(true, Ordering::Release);
                            return None;
                        }
                        written += n as u64;
                        to_send -= n as u64;
                    }

                    if written >= bytes_to_read {
                        return Some(written);
                    }
                    if !read_failed {
                        // Made progress; look for more right away.
                        continue;
                    }
                }
            }

            if segment.is_completed() {
                // Completed but the file cannot back the claim: corrupt or
                // truncated on disk. Re-download at urgent priority.
                redownloads += 1;
                if redownloads > self.config.max_serve_redownloads {
                    warn!(
                        session = self.session_id,
                        start = segment.start_byte(),
                        "Giving up on corrupt segment"
                    );
                    return None;
                }
                warn!(
                    session = self.session_id,
                    start = segment.start_byte(),
                    attempt = redownloads,
                    "Completed segment shorter than expected, re-downloading"
                );
                self.task
                    .update_segment_status(segment, SegmentStatus::Failed, Some(0));
                let _rx = self
                    .queue
                    .enqueue(self.task.queue_item(segment, priority::PLAYING_URGENT));
                segment.wait_for_data(self.config.redownload_wait).await;
                continue;
            }

            // Still downloading (or not started): make sure a download is
            // actually coming (the cold-start thrift may have skipped this
            // segment; the queue dedups re-requests), then wait.
            if segment.can_start_download() {
                let _ = self
                    .queue
                    .enqueue(self.task.queue_item(segment, priority::PLAYING));
            }
            segment.wait_for_data(self.config.serve_poll_interval).await;
        }
    }

    /// Open whichever backing file currently exists, preferring the final
    /// `.seg`. When a file is expected (data was reported) the open retries
    /// briefly to ride out the rename window.
    async fn open_segment_file(
        &self,
        segment: &Segment,
        expect_file: bool,
    ) -> Option<(tokio::fs::File, u64)> {
        let attempts = if expect_file {
            self.config.file_open_retries.max(1)
        } else {
            1
        };
        let final_path = segment.final_path(self.task.cache_dir());
        let temp_path = segment.temp_path(self.task.cache_dir());

        for attempt in 0..attempts {
            for path in [&final_path, &temp_path] {
                if let Ok(file) = tokio::fs::File::open(path).await
                    && let Ok(meta) = file.metadata().await
                {
                    return Some((file, meta.len()));
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.file_open_retry_delay).await;
            }
        }
        None
    }
}
