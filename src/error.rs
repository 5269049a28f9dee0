//! Error types for the cache
//!
//! Provides unified error handling using thiserror. A missing or expired key
//! is never an error; lookups report it through `Option`.

use thiserror::Error;

use crate::cache::CellKind;

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Counter operation used an integer width the cache was not built for
    #[error("Counter kind mismatch: cache holds {expected} cells, got {found}")]
    KindMismatch { expected: CellKind, found: CellKind },

    /// Default TTL must be non-zero
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// The registry was shut down and no longer accepts caches
    #[error("Registry has been shut down")]
    RegistryShutdown,

    /// The background sweeper runtime could not be started
    #[error("Failed to start sweeper: {0}")]
    SweeperStart(#[from] std::io::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mismatch_message() {
        let err = CacheError::KindMismatch {
            expected: CellKind::I64,
            found: CellKind::I32,
        };
        assert_eq!(
            err.to_string(),
            "Counter kind mismatch: cache holds i64 cells, got i32"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "no threads");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::SweeperStart(_)));
    }
}
