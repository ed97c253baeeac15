use std::path::{Path, PathBuf};

use reqwest::StatusCode;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error during {operation} at {path:?}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no space left on device while writing {path:?}")]
    DiskFull { path: PathBuf },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("invalid range `{input}`: {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("upstream reported no usable content length for {url}")]
    UnknownLength { url: String },

    #[error("segment body ended early: wrote {written} of {expected} bytes")]
    IncompleteSegment { written: u64, expected: u64 },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ProxyError {
    /// Wrap an IO error with operation and path context, mapping out-of-space
    /// conditions to the dedicated [`ProxyError::DiskFull`] variant so callers
    /// can trigger emergency eviction instead of retrying.
    pub fn io(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        if is_out_of_space(&source) {
            return Self::DiskFull {
                path: path.to_path_buf(),
            };
        }
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull { .. })
    }

    /// Whether a failed download attempt is worth retrying.
    ///
    /// Disk-full and cancellation abort the retry loop immediately; client
    /// errors from the upstream (4xx) will not improve on retry either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::DiskFull { .. }
            | Self::InvalidRange { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Io { .. }
            | Self::Timeout { .. }
            | Self::UnknownLength { .. }
            | Self::IncompleteSegment { .. }
            | Self::Internal { .. } => true,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

/// ENOSPC detection. Raw OS error 28 is checked in addition to the typed kind
/// because some wrapped errors lose the kind on the way up.
fn is_out_of_space(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
}
