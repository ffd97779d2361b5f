use thiserror::Error;

use crate::retry::RetryError;

/// Typed content-fetch errors enabling retry classification.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP error fetching {url}: {source}")]
    Http { source: reqwest::Error, url: String },

    #[error("Body of {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Cannot resize content: {0}")]
    Resize(#[from] image::ImageError),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl FetchError {
    /// Whether retrying can never succeed.
    ///
    /// Forbidden, missing and gone resources stay that way; a body that
    /// matched its checksum but does not decode as an image will decode no
    /// better on the next attempt. Everything else, including disk errors
    /// and checksum mismatches from truncated transfers, is retried.
    pub fn is_terminal(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => matches!(status, 403 | 404 | 410),
            FetchError::Resize(_) => true,
            FetchError::Http { .. }
            | FetchError::TooLarge { .. }
            | FetchError::ChecksumMismatch { .. }
            | FetchError::Disk(_) => false,
        }
    }
}

/// Why an item was invalidated during the fetch stage.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error(transparent)]
    Download(#[from] RetryError<FetchError>),

    #[error("Failed to write sidecar: {0}")]
    Sidecar(std::io::Error),
}
