//! Global download queue: one priority-ordered pending list and one map of
//! active downloads for the whole process.
//!
//! Scheduling honors a global concurrency cap, a per-media cap, and a startup
//! exclusivity window: while any media holds a startup lock, only tail/`moov`
//! and first-playback work (priority >= [`priority::TAIL`]) may start, so the
//! first bytes a player needs are never starved by background prefetch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProxyConfig, priority};
use crate::downloader::{SegmentDownloader, UpdateHook};
use crate::segment::{Segment, SegmentStatus};

/// One queued segment download.
///
/// Holds only a weak reference to its segment: the segment's lifetime belongs
/// to the task, and a queued item whose task has been dropped simply expires.
pub struct QueueItem {
    media_url: String,
    cache_dir: PathBuf,
    headers: HashMap<String, String>,
    segment: Weak<Segment>,
    start_byte: u64,
    priority: AtomicU32,
    created_at: Instant,
    cancelled: AtomicBool,
    cancel: CancellationToken,
    on_update: Option<UpdateHook>,
    done: Mutex<Option<oneshot::Sender<bool>>>,
}

impl QueueItem {
    pub fn new(
        media_url: impl Into<String>,
        segment: &Arc<Segment>,
        cache_dir: PathBuf,
        headers: HashMap<String, String>,
        priority: u32,
        parent_cancel: &CancellationToken,
        on_update: Option<UpdateHook>,
    ) -> Self {
        Self {
            media_url: media_url.into(),
            cache_dir,
            headers,
            segment: Arc::downgrade(segment),
            start_byte: segment.start_byte(),
            priority: AtomicU32::new(priority),
            created_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            cancel: parent_cancel.child_token(),
            on_update,
            done: Mutex::new(None),
        }
    }

    /// Dedup key: one download per `(media, segment start)` at any instant.
    fn key(&self) -> String {
        format!("{}|{}", self.media_url, self.start_byte)
    }

    fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    /// Resolve the completion channel. Safe to call more than once.
    fn complete(&self, ok: bool) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(ok);
        }
    }
}

enum Pick {
    /// Nothing startable right now.
    Idle,
    /// Item left the queue without a download (cancelled/stale/duplicate).
    Drop(Arc<QueueItem>, bool),
    /// Item moved to active; start its download.
    Start(Arc<QueueItem>, Arc<Segment>),
}

#[derive(Default)]
struct QueueState {
    /// Higher priority first; FIFO within a priority level.
    pending: Vec<Arc<QueueItem>>,
    active: HashMap<String, Arc<QueueItem>>,
    active_per_media: HashMap<String, usize>,
    current_playing: Option<String>,
    startup_locks: HashMap<String, u32>,
}

pub struct DownloadQueue {
    config: Arc<ProxyConfig>,
    downloader: Arc<SegmentDownloader>,
    state: Mutex<QueueState>,
    /// Non-reentrant guard around the scheduling loop.
    processing: AtomicBool,
    /// Set by every kick; lets the loop notice wakeups that raced its exit.
    kick_requested: AtomicBool,
    disk_full_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl DownloadQueue {
    pub fn new(config: Arc<ProxyConfig>, downloader: Arc<SegmentDownloader>) -> Arc<Self> {
        Arc::new(Self {
            config,
            downloader,
            state: Mutex::new(QueueState::default()),
            processing: AtomicBool::new(false),
            kick_requested: AtomicBool::new(false),
            disk_full_handler: Mutex::new(None),
        })
    }

    /// Install the hook invoked when a download hits a full disk. The
    /// embedder wires this to the cache manager's emergency eviction.
    pub fn set_disk_full_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.disk_full_handler.lock() = Some(handler);
    }

    /// Add an item to the queue.
    ///
    /// The returned receiver resolves with the download outcome. Enqueuing a
    /// segment that is already `Completed` resolves `true` immediately;
    /// a segment already `Downloading`, pending, or active drops the sender
    /// (the receiver observes a closed channel). Items for the currently
    /// playing media are floored to [`priority::PLAYING`].
    pub fn enqueue(self: &Arc<Self>, item: QueueItem) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *item.done.lock() = Some(tx);
        let item = Arc::new(item);

        let Some(segment) = item.segment.upgrade() else {
            item.complete(false);
            return rx;
        };
        match segment.status() {
            SegmentStatus::Completed => {
                item.complete(true);
                return rx;
            }
            SegmentStatus::Downloading => return rx,
            SegmentStatus::Pending | SegmentStatus::Failed => {}
        }

        {
            let mut state = self.state.lock();
            let key = item.key();
            if state.active.contains_key(&key) || state.pending.iter().any(|p| p.key() == key) {
                return rx;
            }

            if state.current_playing.as_deref() == Some(item.media_url.as_str()) {
                item.priority.fetch_max(priority::PLAYING, Ordering::Relaxed);
            }

            let effective = item.priority();
            let pos = state
                .pending
                .iter()
                .position(|existing| existing.priority() < effective)
                .unwrap_or(state.pending.len());
            state.pending.insert(pos, item);
        }

        self.kick();
        rx
    }

    /// Mark `url` as the currently playing media: its pending items rise to
    /// at least [`priority::PLAYING`], and (when configured) the previously
    /// playing media's pending items drop to [`priority::BACKGROUND`].
    pub fn set_current_playing(self: &Arc<Self>, url: &str) {
        {
            let mut state = self.state.lock();
            if state.current_playing.as_deref() == Some(url) {
                return;
            }
            let old = state.current_playing.replace(url.to_string());

            for item in &state.pending {
                if item.media_url == url {
                    item.priority.fetch_max(priority::PLAYING, Ordering::Relaxed);
                } else if self.config.pause_old_downloads_on_switch
                    && old.as_deref() == Some(item.media_url.as_str())
                {
                    item.priority.store(priority::BACKGROUND, Ordering::Relaxed);
                }
            }
            // Stable: FIFO order within equal priorities is preserved.
            state
                .pending
                .sort_by_key(|item| std::cmp::Reverse(item.priority()));
        }
        self.kick();
    }

    /// Remove pending items for `url` and optionally cancel its active
    /// downloads. Removed items resolve `false`.
    pub fn cancel_media(&self, url: &str, cancel_active: bool) {
        let removed: Vec<Arc<QueueItem>> = {
            let mut state = self.state.lock();
            let (keep, removed): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|item| item.media_url != url);
            state.pending = keep;

            if cancel_active {
                for item in state.active.values() {
                    if item.media_url == url {
                        item.cancel();
                    }
                }
            }
            removed
        };
        for item in removed {
            item.complete(false);
        }
    }

    /// Stop everything: cancel all active downloads and drop all pending
    /// items. Cancelled segments return to `Pending` and their partial
    /// `.tmp` files are resumed by the next enqueue.
    pub fn pause_all(&self) {
        let removed: Vec<Arc<QueueItem>> = {
            let mut state = self.state.lock();
            for item in state.active.values() {
                item.cancel();
            }
            state.pending.drain(..).collect()
        };
        for item in removed {
            item.complete(false);
        }
    }

    /// Like [`DownloadQueue::pause_all`], but the currently playing media
    /// keeps its work.
    pub fn cancel_all_except_current(&self) {
        let removed: Vec<Arc<QueueItem>> = {
            let mut state = self.state.lock();
            let current = state.current_playing.clone();
            for item in state.active.values() {
                if current.as_deref() != Some(item.media_url.as_str()) {
                    item.cancel();
                }
            }
            let (keep, removed): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|item| current.as_deref() == Some(item.media_url.as_str()));
            state.pending = keep;
            removed
        };
        for item in removed {
            item.complete(false);
        }
    }

    /// Adjust the startup lock count for `url`. While any lock is held the
    /// scheduler refuses to start work below [`priority::TAIL`].
    pub fn update_startup_lock(self: &Arc<Self>, url: &str, delta: i32) {
        {
            let mut state = self.state.lock();
            let count = state.startup_locks.entry(url.to_string()).or_insert(0);
            *count = count.saturating_add_signed(delta);
            if *count == 0 {
                state.startup_locks.remove(url);
            }
        }
        if delta < 0 {
            self.kick();
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_startup_locked(&self) -> bool {
        !self.state.lock().startup_locks.is_empty()
    }

    /// Pending priorities for a media, in queue order.
    pub fn pending_priorities(&self, url: &str) -> Vec<u32> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|item| item.media_url == url)
            .map(|item| item.priority())
            .collect()
    }

    /// Wake the scheduling loop. No-op when a loop is already running; the
    /// running loop re-checks [`Self::kick_requested`] before exiting.
    fn kick(self: &Arc<Self>) {
        self.kick_requested.store(true, Ordering::Release);
        if self.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.process() });
    }

    fn process(self: Arc<Self>) {
        loop {
            self.kick_requested.store(false, Ordering::Release);

            loop {
                let next = {
                    let mut state = self.state.lock();
                    self.pick(&mut state)
                };
                match next {
                    Pick::Idle => break,
                    Pick::Drop(item, ok) => item.complete(ok),
                    Pick::Start(item, segment) => self.spawn_download(item, segment),
                }
            }

            self.processing.store(false, Ordering::Release);
            if !self.kick_requested.load(Ordering::Acquire) {
                return;
            }
            // A kick raced our exit; take the guard back if nobody else did.
            if self.processing.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn pick(&self, state: &mut QueueState) -> Pick {
        if state.pending.is_empty() {
            return Pick::Idle;
        }
        if state.active.len() >= self.config.global_max_concurrent_downloads {
            return Pick::Idle;
        }

        // Startup gate: the head decides whether low-priority work may run.
        if !state.startup_locks.is_empty() && state.pending[0].priority() < priority::TAIL {
            return Pick::Idle;
        }

        let per_media_cap = self.config.per_media_max_concurrent_downloads;
        let Some(idx) = state.pending.iter().position(|item| {
            state
                .active_per_media
                .get(&item.media_url)
                .copied()
                .unwrap_or(0)
                < per_media_cap
        }) else {
            return Pick::Idle;
        };

        let item = state.pending.remove(idx);
        if item.is_cancelled() {
            return Pick::Drop(item, false);
        }
        let Some(segment) = item.segment.upgrade() else {
            return Pick::Drop(item, false);
        };
        match segment.status() {
            SegmentStatus::Completed => Pick::Drop(item, true),
            SegmentStatus::Downloading => Pick::Drop(item, false),
            SegmentStatus::Pending | SegmentStatus::Failed => {
                state.active.insert(item.key(), Arc::clone(&item));
                *state
                    .active_per_media
                    .entry(item.media_url.clone())
                    .or_insert(0) += 1;
                Pick::Start(item, segment)
            }
        }
    }

    fn spawn_download(self: &Arc<Self>, item: Arc<QueueItem>, segment: Arc<Segment>) {
        let queue = Arc::clone(self);
        let downloader = Arc::clone(&self.downloader);
        tokio::spawn(async move {
            debug!(
                url = %item.media_url,
                start = item.start_byte,
                priority = item.priority(),
                queued_ms = item.created_at.elapsed().as_millis() as u64,
                "Starting segment download"
            );

            let ok = match downloader
                .download(
                    &item.media_url,
                    &segment,
                    &item.cache_dir,
                    &item.headers,
                    &item.cancel,
                    item.on_update.as_ref(),
                )
                .await
            {
                Ok(done) => done,
                Err(e) => {
                    if e.is_disk_full() {
                        warn!(url = %item.media_url, start = item.start_byte, "Disk full, requesting emergency eviction");
                        queue.notify_disk_full();
                    } else {
                        warn!(url = %item.media_url, start = item.start_byte, error = %e, "Segment download failed");
                    }
                    false
                }
            };

            queue.finish(&item, ok);
        });
    }

    fn finish(self: &Arc<Self>, item: &Arc<QueueItem>, ok: bool) {
        {
            let mut state = self.state.lock();
            state.active.remove(&item.key());
            if let Some(count) = state.active_per_media.get_mut(&item.media_url) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.active_per_media.remove(&item.media_url);
                }
            }
        }
        item.complete(ok);
        self.kick();
    }

    fn notify_disk_full(&self) {
        if let Some(handler) = &*self.disk_full_handler.lock() {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A queue whose dispatcher never starts anything, for inspecting pure
    /// queue mechanics.
    fn frozen_queue() -> Arc<DownloadQueue> {
        let config = Arc::new(ProxyConfig {
            global_max_concurrent_downloads: 0,
            ..ProxyConfig::default()
        });
        let downloader = Arc::new(SegmentDownloader::new(Arc::clone(&config)).unwrap());
        DownloadQueue::new(config, downloader)
    }

    fn item_for(
        url: &str,
        segment: &Arc<Segment>,
        priority_value: u32,
        cancel: &CancellationToken,
    ) -> QueueItem {
        QueueItem::new(
            url,
            segment,
            PathBuf::from("/tmp/cache"),
            HashMap::new(),
            priority_value,
            cancel,
            None,
        )
    }

    #[tokio::test]
    async fn completed_segment_resolves_true_without_queueing() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        let segment = Arc::new(Segment::new(0, 99));
        segment.set_status(SegmentStatus::Completed);

        let rx = queue.enqueue(item_for("http://a/x.mp4", &segment, priority::PLAYING, &cancel));
        assert!(rx.await.unwrap());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        let segment = Arc::new(Segment::new(0, 99));

        let _rx1 = queue.enqueue(item_for("http://a/x.mp4", &segment, priority::PLAYING, &cancel));
        let rx2 = queue.enqueue(item_for("http://a/x.mp4", &segment, priority::PLAYING, &cancel));

        assert_eq!(queue.pending_count(), 1);
        // The duplicate's sender was dropped.
        assert!(rx2.await.is_err());
    }

    #[tokio::test]
    async fn pending_is_ordered_by_priority_then_fifo() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        let s1 = Arc::new(Segment::new(0, 9));
        let s2 = Arc::new(Segment::new(10, 19));
        let s3 = Arc::new(Segment::new(20, 29));
        let s4 = Arc::new(Segment::new(30, 39));

        let _a = queue.enqueue(item_for("http://a/x.mp4", &s1, priority::PREPLAY, &cancel));
        let _b = queue.enqueue(item_for("http://a/x.mp4", &s2, priority::PLAYING_URGENT, &cancel));
        let _c = queue.enqueue(item_for("http://a/x.mp4", &s3, priority::PREPLAY, &cancel));
        let _d = queue.enqueue(item_for("http://a/x.mp4", &s4, priority::TAIL, &cancel));

        assert_eq!(
            queue.pending_priorities("http://a/x.mp4"),
            vec![
                priority::PLAYING_URGENT,
                priority::TAIL,
                priority::PREPLAY,
                priority::PREPLAY
            ]
        );
    }

    #[tokio::test]
    async fn playing_media_floors_enqueue_priority() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        queue.set_current_playing("http://a/x.mp4");

        let segment = Arc::new(Segment::new(0, 9));
        let _rx = queue.enqueue(item_for("http://a/x.mp4", &segment, priority::BACKGROUND, &cancel));

        assert_eq!(
            queue.pending_priorities("http://a/x.mp4"),
            vec![priority::PLAYING]
        );
    }

    #[tokio::test]
    async fn switching_playing_media_promotes_and_demotes() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();

        let a = Arc::new(Segment::new(0, 9));
        let b = Arc::new(Segment::new(0, 9));
        queue.set_current_playing("http://a/x.mp4");
        let _ra = queue.enqueue(item_for("http://a/x.mp4", &a, priority::PLAYING, &cancel));
        let _rb = queue.enqueue(item_for("http://b/y.mp4", &b, priority::PREPLAY, &cancel));

        queue.set_current_playing("http://b/y.mp4");

        assert_eq!(
            queue.pending_priorities("http://a/x.mp4"),
            vec![priority::BACKGROUND]
        );
        assert_eq!(
            queue.pending_priorities("http://b/y.mp4"),
            vec![priority::PLAYING]
        );
    }

    #[tokio::test]
    async fn cancel_media_resolves_false_and_clears_pending() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        let segment = Arc::new(Segment::new(0, 9));

        let rx = queue.enqueue(item_for("http://a/x.mp4", &segment, priority::PLAYING, &cancel));
        queue.cancel_media("http://a/x.mp4", false);

        assert!(!rx.await.unwrap());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_task_segment_expires_in_queue() {
        let queue = frozen_queue();
        let cancel = CancellationToken::new();
        let segment = Arc::new(Segment::new(0, 9));
        let item = item_for("http://a/x.mp4", &segment, priority::PLAYING, &cancel);
        drop(segment);

        let rx = queue.enqueue(item);
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn startup_lock_blocks_low_priority_head() {
        // A dispatching queue: the gate must keep a PLAYING-priority item
        // pending while a startup lock exists.
        let config = Arc::new(ProxyConfig::default());
        let downloader = Arc::new(SegmentDownloader::new(Arc::clone(&config)).unwrap());
        let queue = DownloadQueue::new(config, downloader);
        let cancel = CancellationToken::new();

        queue.update_startup_lock("http://a/x.mp4", 1);
        assert!(queue.is_startup_locked());

        let segment = Arc::new(Segment::new(0, 9));
        let _rx = queue.enqueue(item_for("http://b/y.mp4", &segment, priority::PLAYING, &cancel));

        // Give the scheduling loop a chance to (incorrectly) dispatch.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.active_count(), 0);

        queue.update_startup_lock("http://a/x.mp4", -1);
        assert!(!queue.is_startup_locked());
    }
}
