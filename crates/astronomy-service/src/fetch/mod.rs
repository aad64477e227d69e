//! Fetching photo payloads from remote locations.
//!
//! The pipeline only knows the [`Fetcher`] trait. [`HttpFetcher`] is the implementation used
//! against real photo hosts.

use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

mod http;

pub use self::http::HttpFetcher;

/// An error that happens when fetching a photo from a remote location.
///
/// Fetch errors are terminal for the request that produced them. They are logged and
/// reported to the delivery step, but never retried or cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The photo was not found at the remote location, or no location is known for it.
    #[error("not found")]
    NotFound,
    /// The photo could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote host's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The photo could not be fetched in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The photo could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// Every request waiting for the photo went away before it arrived.
    #[error("canceled")]
    Canceled,
    /// An unexpected error in the pipeline itself, e.g. a panicking fetcher.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// Creates a [`DownloadError`](Self::DownloadError) from the innermost cause of `error`.
    pub fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }

    /// A short tag for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Canceled => "canceled",
            Self::InternalError => "internalerror",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// The outcome of a single fetch.
pub type FetchResult = Result<Bytes, FetchError>;

/// Turns a key into the raw bytes of a photo.
///
/// Implementations are invoked at most once per cache miss and key, from arbitrary worker
/// threads. The returned future must be `'static`, so implementations clone whatever they
/// need out of `self`.
pub trait Fetcher<K>: Send + Sync + 'static {
    /// Fetches the payload for `key`.
    fn fetch(&self, key: K) -> BoxFuture<'static, FetchResult>;
}
