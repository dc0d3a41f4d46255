//! Error types for job submission, monitoring and artifact persistence.

use std::time::Duration;

/// Errors that can occur while driving an asynchronous generation job.
#[derive(Debug, thiserror::Error)]
pub enum ReelWatchError {
    /// Credentials missing, expired or lacking permission.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote service returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Request was throttled by the remote service.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Monitoring gave up after the configured maximum wait.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Monitoring was cancelled before the job reached a terminal state.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure talking to a remote service.
    #[error("network error: {0}")]
    Network(String),

    /// I/O error (creating folders, writing snapshots or artifacts).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External media tool failed (ffmpeg/ffprobe).
    #[error("media processing failed: {0}")]
    Media(String),

    /// Another monitor currently owns the job folder.
    #[error("job folder is locked by another monitor: {0}")]
    Locked(String),

    /// Remote service answered with something we cannot interpret.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ReelWatchError {
    /// Returns true if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network(_)
        )
    }

    /// Returns the suggested retry delay, if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Network(_) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

/// Result type alias for reelwatch operations.
pub type Result<T> = std::result::Result<T, ReelWatchError>;
