//! Segment: the smallest unit of caching and download.
//!
//! A segment is an inclusive byte range of a media object. While a download
//! is in flight its bytes accumulate in `<start>_<end>.tmp`; an atomic rename
//! to `<start>_<end>.seg` is the commit point. Any number of serving loops
//! may wait on a segment's data-available signal; every flush and every
//! terminal transition wakes all of them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Lifecycle of a segment. Persisted as the integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Completed => 2,
            Self::Failed => 3,
        }
    }

    /// Decode a persisted status. `Downloading` found on disk means the
    /// process died mid-download; the partial state is not trustable, so it
    /// is coerced back to `Pending`.
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug)]
struct SegmentState {
    status: SegmentStatus,
    downloaded_bytes: u64,
    last_update_ms: i64,
}

/// One byte range `[start_byte, end_byte]` of a media object.
#[derive(Debug)]
pub struct Segment {
    start_byte: u64,
    end_byte: u64,
    state: Mutex<SegmentState>,
    data_available: Notify,
}

impl Segment {
    pub fn new(start_byte: u64, end_byte: u64) -> Self {
        Self::with_state(start_byte, end_byte, SegmentStatus::Pending, 0)
    }

    pub fn with_state(
        start_byte: u64,
        end_byte: u64,
        status: SegmentStatus,
        downloaded_bytes: u64,
    ) -> Self {
        debug_assert!(start_byte <= end_byte);
        Self {
            start_byte,
            end_byte,
            state: Mutex::new(SegmentState {
                status,
                downloaded_bytes,
                last_update_ms: chrono::Utc::now().timestamp_millis(),
            }),
            data_available: Notify::new(),
        }
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> u64 {
        self.end_byte
    }

    pub fn expected_size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn overlaps(&self, range_start: u64, range_end: u64) -> bool {
        self.start_byte <= range_end && self.end_byte >= range_start
    }

    pub fn status(&self) -> SegmentStatus {
        self.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() == SegmentStatus::Completed
    }

    /// Pending and Failed segments may (re)start a download.
    pub fn can_start_download(&self) -> bool {
        matches!(
            self.status(),
            SegmentStatus::Pending | SegmentStatus::Failed
        )
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.lock().downloaded_bytes
    }

    pub fn last_update_ms(&self) -> i64 {
        self.state.lock().last_update_ms
    }

    /// Transition the status. A `Completed` transition also records the full
    /// expected size and wakes every waiter.
    pub fn set_status(&self, status: SegmentStatus) {
        {
            let mut state = self.state.lock();
            state.status = status;
            if status == SegmentStatus::Completed {
                state.downloaded_bytes = self.expected_size();
            }
            state.last_update_ms = chrono::Utc::now().timestamp_millis();
        }
        if status.is_terminal() {
            self.data_available.notify_waiters();
        }
    }

    /// Record bytes accumulated by the current download attempt.
    pub fn set_downloaded_bytes(&self, bytes: u64) {
        debug_assert!(bytes <= self.expected_size());
        let mut state = self.state.lock();
        state.downloaded_bytes = bytes;
        state.last_update_ms = chrono::Utc::now().timestamp_millis();
    }

    /// Wake everyone waiting on [`Segment::wait_for_data`].
    pub fn notify_data_available(&self) {
        self.data_available.notify_waiters();
    }

    /// Wait until more data is signalled or `timeout` elapses. Returns `true`
    /// when woken by a signal. Callers re-check file state on every wakeup,
    /// so a missed signal only costs one poll interval.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.data_available.notified())
            .await
            .is_ok()
    }

    pub fn final_file_name(&self) -> String {
        format!("{}_{}.seg", self.start_byte, self.end_byte)
    }

    pub fn temp_file_name(&self) -> String {
        format!("{}_{}.tmp", self.start_byte, self.end_byte)
    }

    pub fn final_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.final_file_name())
    }

    pub fn temp_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.temp_file_name())
    }
}

/// Parse `<start>_<end>` out of a segment file stem.
pub fn parse_segment_stem(stem: &str) -> Option<(u64, u64)> {
    let (start, end) = stem.split_once('_')?;
    let start = start.parse().ok()?;
    let end = end.parse().ok()?;
    if start > end {
        return None;
    }
    Some((start, end))
}
