//! Error types for cache operations.

use thiserror::Error;

/// Errors that can occur during cache operations.
///
/// Expected, recoverable conditions (corrupt entries, lock contention,
/// racing deletes during cleanup) never surface here; the cache absorbs
/// them into misses and busy sentinels. What does surface is I/O that
/// outlived the retry budget and caller misuse.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error that persisted past the access-timeout retry loop.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization failed on write.
    #[error("Failed to serialize payload: {0}")]
    Serialize(String),

    /// The requested operation conflicts with the configured payload mode.
    #[error("Payload mode mismatch: {0}")]
    Config(String),

    /// Reading a raw-bytes payload is not supported; fetch the file path
    /// instead.
    #[error("Reading raw payloads is not supported")]
    RawReadUnsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::RawReadUnsupported;
        assert_eq!(err.to_string(), "Reading raw payloads is not supported");

        let err = CacheError::Config("write mode is Serializable".to_string());
        assert!(err.to_string().contains("Payload mode mismatch"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let cache_err: CacheError = io_err.into();
        assert!(matches!(cache_err, CacheError::Io(_)));
    }
}
