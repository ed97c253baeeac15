//! Preload: warm the cache for a media object before playback starts.
//!
//! [`Preloader::preload`] is the core entry. [`PreloadScheduler`] wraps it in
//! a trailing-edge debouncer so UI scroll events can fire it freely: rapid
//! calls collapse into the last one, and scheduling a new URL preempts the
//! previous URL's queued work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProxyConfig, priority};
use crate::error::Result;
use crate::manager::DownloadManager;
use crate::mp4::MoovPosition;
use crate::queue::DownloadQueue;

const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(300);

pub struct Preloader {
    manager: Arc<DownloadManager>,
    queue: Arc<DownloadQueue>,
    config: Arc<ProxyConfig>,
}

impl Preloader {
    pub fn new(
        manager: Arc<DownloadManager>,
        queue: Arc<DownloadQueue>,
        config: Arc<ProxyConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            queue,
            config,
        })
    }

    /// Download the first `segment_count` uncached segments at
    /// [`priority::PREPLAY`]. With `include_moov`, the tail segment is added
    /// for MP4s whose `moov` trails the data (or unconditionally when the
    /// config says so).
    ///
    /// Resolves once every enqueued download reports. Success means at least
    /// one segment landed and the tail, when requested, did not fail.
    pub async fn preload(
        &self,
        media_url: &str,
        headers: HashMap<String, String>,
        segment_count: usize,
        include_moov: bool,
    ) -> Result<bool> {
        let task = self.manager.get_or_create_task(media_url, headers).await?;
        let content_length = task.content_length();
        if content_length <= 0 {
            return Ok(false);
        }
        let total = content_length as u64;

        let head: Vec<_> = task
            .segments_for_range(0, total - 1)
            .into_iter()
            .filter(|s| !s.is_completed())
            .take(segment_count)
            .collect();

        // (is_critical, receiver)
        let mut waits = Vec::with_capacity(head.len() + 1);
        for segment in &head {
            waits.push((
                false,
                self.queue
                    .enqueue(task.queue_item(segment, priority::PREPLAY)),
            ));
        }

        let want_tail = include_moov
            && ((task.is_mp4() && task.moov_position() == MoovPosition::AtEnd)
                || self.config.always_preload_end_segment);
        if want_tail
            && let Some(last) = task.last_segment()
            && !last.is_completed()
            && !head.iter().any(|s| s.start_byte() == last.start_byte())
        {
            waits.push((
                true,
                self.queue.enqueue(task.queue_item(&last, priority::TAIL)),
            ));
        }

        if waits.is_empty() {
            // Everything interesting is already cached.
            return Ok(true);
        }

        let mut any_succeeded = false;
        let mut critical_failed = false;
        for (critical, rx) in waits {
            match rx.await {
                Ok(true) => any_succeeded = true,
                Ok(false) if critical => critical_failed = true,
                // Ok(false) for a non-critical segment, or a drop because
                // the download is already running elsewhere: neutral.
                _ => {}
            }
        }

        debug!(
            url = %media_url,
            any_succeeded,
            critical_failed,
            "Preload finished"
        );
        Ok(any_succeeded && !critical_failed)
    }
}

struct ScheduledPreload {
    media_url: String,
    token: CancellationToken,
}

/// 300 ms trailing-edge debouncer over [`Preloader::preload`].
pub struct PreloadScheduler {
    preloader: Arc<Preloader>,
    current: Mutex<Option<ScheduledPreload>>,
}

impl PreloadScheduler {
    pub fn new(preloader: Arc<Preloader>) -> Self {
        Self {
            preloader,
            current: Mutex::new(None),
        }
    }

    /// Schedule a preload for `media_url`, replacing whatever was scheduled
    /// before. A previously executing preload for another URL is preempted
    /// and its queued work cancelled.
    pub fn schedule(
        &self,
        media_url: &str,
        headers: HashMap<String, String>,
        segment_count: usize,
        include_moov: bool,
    ) {
        let token = CancellationToken::new();
        let previous = self.current.lock().replace(ScheduledPreload {
            media_url: media_url.to_string(),
            token: token.clone(),
        });
        if let Some(previous) = previous {
            debug!(url = %previous.media_url, "Preempting scheduled preload");
            previous.token.cancel();
        }

        let preloader = Arc::clone(&self.preloader);
        let media_url = media_url.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(DEBOUNCE_INTERVAL) => {}
            }

            tokio::select! {
                _ = token.cancelled() => {
                    // Preempted mid-flight: drop this URL's queued work.
                    preloader.queue.cancel_media(&media_url, false);
                }
                result = preloader.preload(&media_url, headers, segment_count, include_moov) => {
                    match result {
                        Ok(ok) => debug!(url = %media_url, ok, "Scheduled preload finished"),
                        Err(e) => warn!(url = %media_url, error = %e, "Scheduled preload failed"),
                    }
                }
            }
        });
    }

    /// Drop the scheduled (or executing) preload, if any.
    pub fn cancel(&self) {
        if let Some(previous) = self.current.lock().take() {
            previous.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::SegmentDownloader;
    use crate::task::{CONFIG_FILE_NAME, DownloadTask};
    use std::path::Path;

    fn stack(root: &Path, frozen: bool) -> (Arc<DownloadManager>, Arc<DownloadQueue>, Arc<ProxyConfig>) {
        let config = Arc::new(ProxyConfig {
            segment_size: 1024,
            global_max_concurrent_downloads: if frozen { 0 } else { 4 },
            ..ProxyConfig::default()
        });
        let downloader = Arc::new(SegmentDownloader::new(Arc::clone(&config)).unwrap());
        let queue = DownloadQueue::new(Arc::clone(&config), Arc::clone(&downloader));
        let manager = DownloadManager::new(root, Arc::clone(&config), Arc::clone(&queue), downloader);
        (manager, queue, config)
    }

    /// Seed a fully cached media: config plus valid `.seg` files.
    async fn seed_complete(root: &Path, url: &str, len: u64, segment_size: u64) {
        let dir = root.join(DownloadTask::dir_hash(url, &HashMap::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let config = serde_json::json!({
            "contentLength": len,
            "contentType": "video/mp4",
            "lastAccessTime": chrono::Utc::now().timestamp_millis(),
            "requestHeaders": null,
            "segments": [],
        });
        tokio::fs::write(dir.join(CONFIG_FILE_NAME), config.to_string())
            .await
            .unwrap();

        let mut start = 0u64;
        while start < len {
            let end = (start + segment_size - 1).min(len - 1);
            tokio::fs::write(
                dir.join(format!("{start}_{end}.seg")),
                vec![0u8; (end - start + 1) as usize],
            )
            .await
            .unwrap();
            start = end + 1;
        }
    }

    #[tokio::test]
    async fn fully_cached_media_preloads_trivially() {
        let root = tempfile::tempdir().unwrap();
        let url = "https://example.com/cached.mp4";
        seed_complete(root.path(), url, 4096, 1024).await;

        let (manager, queue, config) = stack(root.path(), true);
        let preloader = Preloader::new(manager, queue, config);

        let ok = preloader
            .preload(url, HashMap::new(), 3, true)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn preload_enqueues_head_segments_at_preplay() {
        let root = tempfile::tempdir().unwrap();
        let url = "https://example.com/fresh.mp4";

        // Config present (no probe needed) but nothing downloaded.
        let dir = root.path().join(DownloadTask::dir_hash(url, &HashMap::new()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let config_json = serde_json::json!({
            "contentLength": 8192,
            "contentType": "video/mp4",
            "lastAccessTime": chrono::Utc::now().timestamp_millis(),
            "requestHeaders": null,
            "segments": [],
        });
        tokio::fs::write(dir.join(CONFIG_FILE_NAME), config_json.to_string())
            .await
            .unwrap();

        let (manager, queue, config) = stack(root.path(), true);
        let preloader = Preloader::new(manager, Arc::clone(&queue), config);

        // Run the preload without awaiting its completion (the frozen queue
        // never resolves the receivers).
        let handle = {
            let preloader = Arc::clone(&preloader);
            let url = url.to_string();
            tokio::spawn(async move { preloader.preload(&url, HashMap::new(), 2, false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            queue.pending_priorities(url),
            vec![priority::PREPLAY, priority::PREPLAY]
        );
        handle.abort();
    }

    #[tokio::test]
    async fn scheduling_a_new_url_preempts_the_old_one() {
        let root = tempfile::tempdir().unwrap();
        let url_a = "https://example.com/a.mp4";
        let url_b = "https://example.com/b.mp4";
        for url in [url_a, url_b] {
            let dir = root.path().join(DownloadTask::dir_hash(url, &HashMap::new()));
            tokio::fs::create_dir_all(&dir).await.unwrap();
            let config_json = serde_json::json!({
                "contentLength": 4096,
                "contentType": "video/mp4",
                "lastAccessTime": chrono::Utc::now().timestamp_millis(),
                "requestHeaders": null,
                "segments": [],
            });
            tokio::fs::write(dir.join(CONFIG_FILE_NAME), config_json.to_string())
                .await
                .unwrap();
        }

        let (manager, queue, config) = stack(root.path(), true);
        let scheduler = PreloadScheduler::new(Preloader::new(manager, Arc::clone(&queue), config));

        scheduler.schedule(url_a, HashMap::new(), 2, false);
        // Let A's debounce fire and its enqueues land.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!queue.pending_priorities(url_a).is_empty());

        scheduler.schedule(url_b, HashMap::new(), 2, false);
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert!(queue.pending_priorities(url_a).is_empty());
        assert!(!queue.pending_priorities(url_b).is_empty());
    }

    #[tokio::test]
    async fn cancel_before_debounce_schedules_nothing() {
        let root = tempfile::tempdir().unwrap();
        let url = "https://example.com/never.mp4";
        let (manager, queue, config) = stack(root.path(), true);
        let scheduler = PreloadScheduler::new(Preloader::new(manager, Arc::clone(&queue), config));

        scheduler.schedule(url, HashMap::new(), 2, false);
        scheduler.cancel();
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(queue.pending_count(), 0);
    }
}
