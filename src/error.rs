use thiserror::Error;

/// Error type shared across the fetch/cache/sweep paths.
///
/// Variants carry owned strings instead of the source error so a single
/// download outcome can be cloned out to every waiter attached to it.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Network error for {url}: {reason}")] Network {
        url: String,
        reason: String,
    },

    #[error("HTTP {status} from {url}")] HttpStatus {
        url: String,
        status: u16,
    },

    #[error("Parse error for {url}: {reason}")] Parse {
        url: String,
        reason: String,
    },

    #[error("Database error: {0}")] Store(String),

    #[error("Configuration error: {0}")] Config(String),
}

impl FetchError {
    /// Network-level failures are retried by the queue; everything else is
    /// surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::HttpStatus { .. }
        )
    }
}

impl From<rusqlite::Error> for FetchError {
    fn from(err: rusqlite::Error) -> Self {
        FetchError::Store(err.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
