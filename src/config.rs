use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Download priority levels used by the global queue.
///
/// Higher values are scheduled first. Within one level the queue is FIFO.
pub mod priority {
    /// Opportunistic work for media that is not currently playing.
    pub const BACKGROUND: u32 = 10;
    /// Preload requests issued before playback starts.
    pub const PREPLAY: u32 = 50;
    /// Segments of the currently playing media.
    pub const PLAYING: u32 = 100;
    /// Tail / `moov` segments needed to begin decoding.
    pub const TAIL: u32 = PLAYING_URGENT - 50;
    /// The first playback segment of a fresh request.
    pub const PLAYING_URGENT: u32 = 200;
}

/// Configurable options for the caching proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Size of each cache segment in bytes. The last segment of a media
    /// object may be shorter.
    pub segment_size: u64,

    /// Ceiling on the number of segments per media object. When the natural
    /// division of `content_length / segment_size` would exceed this, the
    /// effective segment size is enlarged instead.
    pub max_segment_count: u64,

    /// Maximum concurrent segment downloads across all media.
    pub global_max_concurrent_downloads: usize,

    /// Maximum concurrent segment downloads for a single media object.
    pub per_media_max_concurrent_downloads: usize,

    /// Upper bound for the on-disk cache before eviction kicks in.
    pub max_cache_size: u64,

    /// After a size-triggered cleanup the cache is reduced to
    /// `max_cache_size * cache_cleanup_ratio`.
    pub cache_cleanup_ratio: f64,

    /// Number of leading bytes fetched to locate the MP4 `moov` atom.
    pub moov_detection_bytes: u64,

    /// Files smaller than this skip `moov` detection entirely and are assumed
    /// to be fast-start.
    pub skip_moov_detection_threshold: u64,

    /// Attempts per segment download before giving up.
    pub download_retry_count: u32,

    /// Base delay between download retries; doubles each failure.
    pub download_retry_initial_delay: Duration,

    /// Connection timeout for upstream requests.
    pub connect_timeout: Duration,

    /// Idle timeout for pooled upstream connections.
    pub idle_timeout: Duration,

    /// Maximum time between two body chunks of an upstream response.
    pub stream_read_timeout: Duration,

    /// Debounce interval for persisting per-task `config.json` updates.
    /// Terminal segment transitions bypass the debounce and flush directly.
    pub config_save_interval: Duration,

    /// Aggressive prefetch window, in segments, beyond the requested range.
    pub prefetch_window_segments: u64,

    /// When playback switches to another media, demote the old media's
    /// pending downloads to [`priority::BACKGROUND`].
    pub pause_old_downloads_on_switch: bool,

    /// Preload the final segment even for media where the `moov` atom is at
    /// the start (or the format is unknown).
    pub always_preload_end_segment: bool,

    /// Retries when opening a segment file races a rename.
    pub file_open_retries: u32,

    /// Delay between segment file open retries.
    pub file_open_retry_delay: Duration,

    /// Poll interval while waiting for a downloading segment to grow.
    pub serve_poll_interval: Duration,

    /// How long a serving loop waits for a re-enqueued corrupt segment.
    pub redownload_wait: Duration,

    /// Re-download attempts per segment within one serving session.
    pub max_serve_redownloads: u32,

    /// `.tmp` leftovers older than this are pruned before cold task creation.
    pub tmp_max_age: Duration,

    /// User agent for upstream requests.
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            segment_size: 2 * 1024 * 1024,
            max_segment_count: 5000,
            global_max_concurrent_downloads: 4,
            per_media_max_concurrent_downloads: 3,
            max_cache_size: 500 * 1024 * 1024,
            cache_cleanup_ratio: 0.7,
            moov_detection_bytes: 64,
            skip_moov_detection_threshold: 5 * 1024 * 1024,
            download_retry_count: 3,
            download_retry_initial_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            stream_read_timeout: Duration::from_secs(15),
            config_save_interval: Duration::from_secs(1),
            prefetch_window_segments: 2,
            pause_old_downloads_on_switch: true,
            always_preload_end_segment: false,
            file_open_retries: 3,
            file_open_retry_delay: Duration::from_millis(50),
            serve_poll_interval: Duration::from_millis(500),
            redownload_wait: Duration::from_secs(15),
            max_serve_redownloads: 3,
            tmp_max_age: Duration::from_secs(24 * 3600),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl ProxyConfig {
    /// Effective segment size for a media object, enlarged when the natural
    /// division would exceed [`ProxyConfig::max_segment_count`]. Enlarged
    /// sizes are rounded up to a 1 MiB boundary.
    pub fn segment_size_for(&self, content_length: u64) -> u64 {
        let natural = content_length.div_ceil(self.segment_size.max(1));
        if natural <= self.max_segment_count {
            return self.segment_size;
        }

        const MIB: u64 = 1024 * 1024;
        let required = content_length.div_ceil(self.max_segment_count);
        required.div_ceil(MIB) * MIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_segment_size_kept_for_ordinary_files() {
        let config = ProxyConfig::default();
        assert_eq!(config.segment_size_for(500 * 1024 * 1024), 2 * 1024 * 1024);
    }

    #[test]
    fn segment_size_enlarged_beyond_cap() {
        let config = ProxyConfig::default();
        // 20 TiB at 2 MiB per segment would need far more than 5000 segments.
        let content_length = 20 * 1024u64.pow(4);
        let size = config.segment_size_for(content_length);
        assert!(content_length.div_ceil(size) <= config.max_segment_count);
        assert_eq!(size % (1024 * 1024), 0);
    }

    #[test]
    fn tail_priority_sits_between_playing_and_urgent() {
        assert!(priority::PLAYING < priority::TAIL);
        assert!(priority::TAIL < priority::PLAYING_URGENT);
        assert_eq!(priority::TAIL, 150);
    }
}
