//! Error types for the voice logging core

use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the voice core
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable failure talking to the backend (timeout, 5xx, offline)
    #[error("Transient sync failure: {0}")]
    Transient(String),

    /// The backend rejected the request; retrying will not help
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Speech provider failed: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("No active voice session")]
    NoActiveSession,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a failed sync should be re-queued rather than surfaced
    ///
    /// Only transport failures count for [`Error::Network`]; a response that could
    /// not be decoded will fail the same way next time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Io(_) => true,
            Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(Error::Io(std::io::Error::other("reset")).is_retryable());
        assert!(!Error::Validation("inactive exercise".into()).is_retryable());
        assert!(!Error::NoActiveSession.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_network_error_classified_by_kind() {
        // an unparseable url fails while building, before anything is sent
        let err = reqwest::Client::new()
            .get("http://[::1")
            .build()
            .unwrap_err();
        assert!(err.is_builder());
        assert!(!Error::Network(err).is_retryable());

        let decode = serde_json::from_str::<bool>("{").unwrap_err();
        assert!(!Error::Serialization(decode).is_retryable());
    }
}
