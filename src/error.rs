// Error taxonomy. Display strings double as machine-readable wire codes.

use thiserror::Error;

/// Failure modes of the resumable HTTP protocol client.
///
/// Retryable variants are retried internally with backoff; what escapes the
/// client is already terminal for the attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http_{0}")]
    Http(u16),
    #[error("incomplete_body")]
    IncompleteBody,
    #[error("range_not_satisfiable")]
    RangeNotSatisfiable,
    #[error("missing_url")]
    MissingUrl,
    #[error("network_error: {0}")]
    Network(String),
    #[error("aborted")]
    Aborted,
    #[error("sink_failed: {0}")]
    SinkFailed(String),
}

impl FetchError {
    /// Failure classes that qualify for the legacy-transport fallback.
    pub fn qualifies_for_fallback(&self) -> bool {
        matches!(
            self,
            FetchError::Http(_)
                | FetchError::Network(_)
                | FetchError::IncompleteBody
                | FetchError::RangeNotSatisfiable
        )
    }
}

/// Cache store failures. Swallowed on the write path after one
/// evict-and-retry attempt: caching never fails the download it follows.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt_entry: {0}")]
    Corrupt(String),
}

/// Terminal outcomes of a fresh-URL waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaiterError {
    #[error("file_url_refresh_timeout")]
    Timeout,
    #[error("file_url_refresh_send_failed")]
    SendFailed,
    #[error("missing_url")]
    MissingUrl,
    #[error("reset")]
    Reset,
    #[error("download_failed")]
    DownloadFailed,
}
