//! # Error Types
//!
//! Define the error classes surfaced by the cache. Only three classes reach
//! callers in practice: closed-cache, invalid-value, and I/O; everything else
//! is handled internally by dropping the affected entry.

use std::sync::Arc;

use thiserror::Error;

/// Result type used across the TierKV crates.
pub type TkvResult<T> = Result<T, TkvError>;

/// Errors surfaced by the cache.
#[derive(Debug, Error)]
pub enum TkvError {
    /// Any operation issued after `close`.
    #[error("cache is closed")]
    Closed,

    /// The value cannot be represented by the codec.
    #[error("value is not serializable: {0}")]
    InvalidValue(#[from] serde_json::Error),

    /// Unrecoverable filesystem failure, propagated from an atomic write or
    /// from store initialization.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A key pattern failed to compile.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Failure observed through a shared in-flight computation. Every waiter
    /// of a failed `get_or_set` receives the same underlying error.
    #[error("{0}")]
    Shared(Arc<TkvError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_errors_display_the_inner_error() {
        let inner = Arc::new(TkvError::Closed);
        let shared = TkvError::Shared(inner);
        assert_eq!(shared.to_string(), "cache is closed");
    }

    #[test]
    fn io_errors_convert() {
        let err: TkvError = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into();
        assert!(matches!(err, TkvError::Io(_)));
    }
}
