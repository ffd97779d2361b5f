use thiserror::Error;

/// Failure fetching one catalog page.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog response is not a JSON array of records: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Whether retrying the same request can never succeed.
    ///
    /// Rejected credentials and unknown endpoints stay broken no matter how
    /// often the page is requested, so they abort the run instead of
    /// burning the retry budget.
    pub fn is_terminal(&self) -> bool {
        match self {
            CatalogError::HttpStatus { status, .. } => {
                matches!(status, 400 | 401 | 403 | 404 | 410 | 422)
            }
            CatalogError::Http(_) => false,
            CatalogError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> CatalogError {
        CatalogError::HttpStatus {
            status,
            url: "x".into(),
        }
    }

    #[test]
    fn test_auth_failures_are_terminal() {
        assert!(status(401).is_terminal());
        assert!(status(403).is_terminal());
        assert!(status(422).is_terminal());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(!status(500).is_terminal());
        assert!(!status(502).is_terminal());
        assert!(!status(429).is_terminal());
    }

    #[test]
    fn test_decode_is_retryable() {
        // Truncated bodies from an overloaded upstream decode as garbage.
        assert!(!CatalogError::Decode("eof".into()).is_terminal());
    }
}
