//! Download manager: the task registry, cache accounting, and eviction.
//!
//! Eviction is a strategy object. The default [`SmartCachePolicy`] runs two
//! phases: entries idle longer than the TTL go first, and if the cache is
//! still over budget the survivors are evicted in LRU order until the size
//! drops below `max_size * cleanup_ratio`. Entries with live sessions are
//! never evicted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::downloader::SegmentDownloader;
use crate::error::{ProxyError, Result};
use crate::queue::DownloadQueue;
use crate::task::{CONFIG_FILE_NAME, DownloadTask};

/// One on-disk cache directory, as seen by an eviction policy.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub last_access_ms: i64,
    pub size: u64,
    /// Whether a task with live sessions owns this directory right now.
    pub active: bool,
}

/// Strategy for choosing which cache directories to delete.
pub trait EvictionPolicy: Send + Sync {
    /// Return the paths to evict given the current total size and the size
    /// budget. Implementations must never select active entries.
    fn select_entries_to_evict(
        &self,
        current_size: u64,
        max_size: u64,
        entries: &[CacheEntry],
    ) -> Vec<PathBuf>;
}

/// TTL-then-LRU eviction.
#[derive(Debug, Clone)]
pub struct SmartCachePolicy {
    /// Entries idle longer than this are dropped regardless of size.
    pub max_age: Duration,
    /// Size-triggered cleanup reduces the cache to `max_size * cleanup_ratio`.
    pub cleanup_ratio: f64,
}

impl Default for SmartCachePolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            cleanup_ratio: 0.7,
        }
    }
}

impl EvictionPolicy for SmartCachePolicy {
    fn select_entries_to_evict(
        &self,
        current_size: u64,
        max_size: u64,
        entries: &[CacheEntry],
    ) -> Vec<PathBuf> {
        let now = chrono::Utc::now().timestamp_millis();
        let max_age_ms = self.max_age.as_millis() as i64;

        let mut evict = Vec::new();
        let mut remaining = current_size;
        let mut survivors: Vec<&CacheEntry> = Vec::new();

        // Phase 1: TTL.
        for entry in entries {
            if entry.active {
                continue;
            }
            if now - entry.last_access_ms > max_age_ms {
                remaining = remaining.saturating_sub(entry.size);
                evict.push(entry.path.clone());
            } else {
                survivors.push(entry);
            }
        }

        // Phase 2: LRU down to the ratio target.
        if remaining > max_size {
            let target = (max_size as f64 * self.cleanup_ratio) as u64;
            survivors.sort_by_key(|entry| entry.last_access_ms);
            for entry in survivors {
                if remaining <= target {
                    break;
                }
                remaining = remaining.saturating_sub(entry.size);
                evict.push(entry.path.clone());
            }
        }

        evict
    }
}

/// Minimal view of `config.json`, enough for eviction decisions.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedMeta {
    last_access_time: i64,
}

type CreationResult = std::result::Result<Arc<DownloadTask>, String>;

/// One initialization cell per identity currently being created. The first
/// caller to poll the cell runs the initialization; everyone else awaits the
/// same result. `String` instead of `ProxyError` because waiters each need
/// their own copy.
type CreationCell = Arc<OnceCell<CreationResult>>;

pub struct DownloadManager {
    cache_root: PathBuf,
    config: Arc<ProxyConfig>,
    queue: Arc<DownloadQueue>,
    downloader: Arc<SegmentDownloader>,
    tasks: DashMap<String, Arc<DownloadTask>>,
    creating: DashMap<String, CreationCell>,
}

impl DownloadManager {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        config: Arc<ProxyConfig>,
        queue: Arc<DownloadQueue>,
        downloader: Arc<SegmentDownloader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache_root: cache_root.into(),
            config,
            queue,
            downloader,
            tasks: DashMap::new(),
            creating: DashMap::new(),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// Look up an in-memory task without creating one.
    pub fn get_task(
        &self,
        media_url: &str,
        headers: &HashMap<String, String>,
    ) -> Option<Arc<DownloadTask>> {
        let key = DownloadTask::identity(media_url, headers);
        self.tasks.get(&key).map(|entry| Arc::clone(&entry))
    }

    /// Get the task for `(media_url, headers)`, creating and initializing it
    /// on first use. Concurrent creators for the same identity converge on
    /// one [`CreationCell`]: whoever polls first runs the initialization,
    /// later callers await the shared result, and if the running caller's
    /// request is dropped mid-flight the cell hands initialization to the
    /// next waiter instead of stranding it.
    pub async fn get_or_create_task(
        &self,
        media_url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Arc<DownloadTask>> {
        let key = DownloadTask::identity(media_url, &headers);

        if let Some(task) = self.tasks.get(&key) {
            task.touch();
            return Ok(Arc::clone(&task));
        }

        // Cold path: tidy the cache before growing it.
        self.auto_cleanup().await;

        let cell: CreationCell = self.creating.entry(key.clone()).or_default().clone();
        let result = cell
            .get_or_init(|| {
                let creation_key = key.clone();
                async move {
                    // A racing creator may have finished while this caller
                    // was still in the cold path.
                    if let Some(existing) = self.tasks.get(&creation_key) {
                        existing.touch();
                        return Ok(Arc::clone(&existing));
                    }

                    let task = DownloadTask::new(
                        media_url,
                        headers,
                        &self.cache_root,
                        Arc::clone(&self.config),
                        Arc::clone(&self.queue),
                        self.downloader.client().clone(),
                    );

                    match task.initialize().await {
                        Ok(()) => {
                            self.tasks.insert(creation_key, Arc::clone(&task));
                            Ok(task)
                        }
                        Err(e) => {
                            warn!(url = %media_url, error = %e, "Task initialization failed");
                            Err(e.to_string())
                        }
                    }
                }
            })
            .await
            .clone();

        self.creating.remove(&key);
        result.map_err(ProxyError::internal)
    }

    /// Drop the in-memory task when no session references it. Cache files
    /// stay on disk.
    pub async fn remove_task_if_inactive(&self, media_url: &str, headers: &HashMap<String, String>) {
        let key = DownloadTask::identity(media_url, headers);
        let Some(task) = self.tasks.get(&key).map(|t| Arc::clone(&t)) else {
            return;
        };
        if task.session_count() > 0 {
            return;
        }
        if let Err(e) = task.flush().await {
            warn!(url = %media_url, error = %e, "Flushing task on eviction failed");
        }
        self.tasks
            .remove_if(&key, |_, task| task.session_count() == 0);
    }

    /// Delete a media's cache directory. The directory hash is recomputed
    /// from the identity, so this works with no in-memory task present.
    pub async fn remove_media_cache(
        &self,
        media_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        let key = DownloadTask::identity(media_url, headers);
        if let Some((_, task)) = self.tasks.remove(&key) {
            task.cancel();
        }
        self.queue.cancel_media(media_url, true);

        let dir = self
            .cache_root
            .join(DownloadTask::dir_hash(media_url, headers));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProxyError::io("removing media cache", &dir, e)),
        }
    }

    /// Total size of the cache root, in bytes.
    pub async fn cache_size(&self) -> u64 {
        let mut total = 0u64;
        for entry in self.scan_entries().await {
            total += entry.size;
        }
        total
    }

    /// Delete every inactive cache directory.
    pub async fn clear_all_cache(&self) {
        for entry in self.scan_entries().await {
            if entry.active {
                warn!(path = %entry.path.display(), "Skipping active entry during cache clear");
                continue;
            }
            self.delete_entry(&entry.path).await;
        }
    }

    /// Run an eviction policy against the on-disk cache. Returns the number
    /// of bytes freed.
    pub async fn cleanup_cache(&self, max_size: u64, policy: &dyn EvictionPolicy) -> u64 {
        let entries = self.scan_entries().await;
        let current: u64 = entries.iter().map(|e| e.size).sum();
        if entries.is_empty() {
            return 0;
        }

        let selected = policy.select_entries_to_evict(current, max_size, &entries);
        let mut freed = 0u64;
        for path in selected {
            let Some(entry) = entries.iter().find(|e| e.path == path) else {
                continue;
            };
            if entry.active {
                warn!(path = %path.display(), "Eviction policy selected an active entry, skipping");
                continue;
            }
            self.delete_entry(&path).await;
            freed += entry.size;
        }
        if freed > 0 {
            info!(
                freed,
                current,
                max_size,
                "Cache cleanup finished"
            );
        }
        freed
    }

    /// Disk-full response: shrink hard, to half of the configured budget.
    pub async fn emergency_cleanup(&self) {
        warn!("Disk full, running emergency cache eviction");
        let policy = SmartCachePolicy {
            cleanup_ratio: 1.0,
            ..SmartCachePolicy::default()
        };
        self.cleanup_cache(self.config.max_cache_size / 2, &policy)
            .await;
    }

    /// Pre-creation housekeeping: drop stale `.tmp` leftovers, then run the
    /// size-triggered policy if the cache outgrew its budget.
    async fn auto_cleanup(&self) {
        self.prune_stale_tmp().await;
        let size = self.cache_size().await;
        if size > self.config.max_cache_size {
            self.cleanup_cache(self.config.max_cache_size, &SmartCachePolicy::default())
                .await;
        }
    }

    async fn prune_stale_tmp(&self) {
        let Ok(mut root) = tokio::fs::read_dir(&self.cache_root).await else {
            return;
        };
        while let Ok(Some(dir)) = root.next_entry().await {
            let Ok(mut files) = tokio::fs::read_dir(dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    continue;
                }
                let stale = file
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.elapsed().ok())
                    .is_some_and(|age| age > self.config.tmp_max_age);
                if stale {
                    debug!(path = %path.display(), "Pruning stale temp file");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }

    /// Enumerate cache directories. Entries whose `config.json` is corrupt
    /// are deleted eagerly (unless active).
    async fn scan_entries(&self) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        let Ok(mut root) = tokio::fs::read_dir(&self.cache_root).await else {
            return entries;
        };

        let active_dirs: Vec<PathBuf> = self
            .tasks
            .iter()
            .filter(|task| task.session_count() > 0)
            .map(|task| task.cache_dir().to_path_buf())
            .collect();

        while let Ok(Some(dir)) = root.next_entry().await {
            let path = dir.path();
            if !dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let active = active_dirs.iter().any(|d| d == &path);

            // A directory without a config may be mid-creation; leave it be.
            let Ok(raw) = tokio::fs::read(path.join(CONFIG_FILE_NAME)).await else {
                continue;
            };
            let meta: PersistedMeta = match serde_json::from_slice(&raw) {
                Ok(meta) => meta,
                Err(_) => {
                    if active {
                        continue;
                    }
                    warn!(path = %path.display(), "Deleting cache entry with corrupt config");
                    self.delete_entry(&path).await;
                    continue;
                }
            };

            entries.push(CacheEntry {
                size: dir_size(&path).await,
                last_access_ms: meta.last_access_time,
                active,
                path,
            });
        }
        entries
    }

    async fn delete_entry(&self, path: &Path) {
        self.tasks
            .retain(|_, task| task.cache_dir() != path || task.session_count() > 0);
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete cache entry");
        }
    }
}

async fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(mut dir) = tokio::fs::read_dir(path).await else {
        return 0;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if let Ok(meta) = entry.metadata().await
            && meta.is_file()
        {
            total += meta.len();
        }
    }
    total
}
