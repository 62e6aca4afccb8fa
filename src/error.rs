//! Error types for drive-organizer
//!
//! Storage calls, crawls, the task queue and the analysis routine each get
//! their own enum so callers can match on the cases they recover from:
//! - [`StorageError`] is classified by [`ErrorKind`] for the retry policy
//! - [`CrawlError::Cancelled`] is the cancellation signal and is never retried
//! - [`TaskQueueError`] covers synchronous rejections at submission time

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of a storage failure, used to pick a recovery path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Provider throttled the call (HTTP 429 or equivalent)
    Quota,
    /// Credential expired or rejected
    Auth,
    /// Timeout, connection reset, 5xx
    Transient,
    /// Target does not exist
    NotFound,
    /// Anything else; not retried
    Other,
}

/// Errors returned by a storage provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("rate limited by provider on {endpoint}")]
    RateLimited { endpoint: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::Quota,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Transient(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::Quota
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::NotFound => Self::NotFound(e.to_string()),
            Io::PermissionDenied => Self::Auth(e.to_string()),
            Io::TimedOut | Io::Interrupted | Io::WouldBlock => Self::Transient(e.to_string()),
            _ => Self::Other(e.to_string()),
        }
    }
}

/// Errors escaping a crawl
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrawlError {
    /// The task's cancellation token fired; unwinds the whole crawl
    #[error("crawl cancelled")]
    Cancelled,

    /// A failure that makes the rest of the crawl pointless (e.g. auth refresh failed)
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CrawlError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from the analysis routine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("analysis cancelled")]
    Cancelled,

    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Synchronous rejections from [`TaskQueueManager::submit`](crate::services::task_queue::TaskQueueManager::submit)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskQueueError {
    #[error("folder {folder_id} already has an active task ({task_id})")]
    Duplicate { folder_id: String, task_id: Uuid },

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("task queue has been shut down")]
    ShutDown,
}

/// Returns true if any error in the chain is a cancellation signal
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<CrawlError>(), Some(CrawlError::Cancelled))
            || matches!(cause.downcast_ref::<AnalysisError>(), Some(AnalysisError::Cancelled))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_kinds() {
        let err = StorageError::RateLimited { endpoint: "list".into() };
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert!(err.is_rate_limited());
        assert_eq!(StorageError::Auth("expired".into()).kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(StorageError::from(io).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cancellation_detected_through_context() {
        let err = anyhow::Error::new(CrawlError::Cancelled).context("crawling folder 42");
        assert!(is_cancellation(&err));

        let err = anyhow::Error::new(CrawlError::Storage(StorageError::Other("boom".into())));
        assert!(!is_cancellation(&err));
    }
}
