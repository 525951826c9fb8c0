use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while fetching, caching or persisting a resource.
///
/// The error is cheap to clone, as a single failed fetch is reported to every request that was
/// waiting for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource could not be fetched, due to a transport problem like connection loss or DNS
    /// resolution, or because the remote responded with a non-successful status.
    ///
    /// The attached string contains a description of the failure.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// The resource could not be fetched within the configured fetch timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The resource was fetched successfully, but the payload was rejected.
    ///
    /// Payloads rejected this way are never cached.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Writing to, or loading from the persistent store failed.
    ///
    /// This never fails a fetch; the affected entry stays valid in memory.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    /// The directory backing the persistent store could not be created.
    ///
    /// Persistence is disabled for the session when this happens.
    #[error("failed to create cache folder: {0}")]
    FolderCreationFailed(String),
    /// The request was cancelled by its caller before the fetch completed.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in downloadkit itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::PersistenceFailed(err.to_string())
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short tag for this error, used in metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::FetchFailed(_) => "fetch-failed",
            CacheError::Timeout(_) => "timeout",
            CacheError::DecodeFailed(_) => "decode-failed",
            CacheError::PersistenceFailed(_) => "persistence-failed",
            CacheError::FolderCreationFailed(_) => "folder-creation-failed",
            CacheError::Cancelled => "cancelled",
            CacheError::InternalError => "internal",
        }
    }
}

/// The result of a cache operation: either `Ok(T)` or an error denoting the reason why a
/// resource could not be provided.
pub type CacheContents<T = ()> = Result<T, CacheError>;
