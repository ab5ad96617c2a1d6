//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid configuration, detected at construction and never retried
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure on a direct request path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied generator, encoder or decoder failed
    #[error("Value transform failed: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A synchronous convenience method was invoked without the
    /// synchronous capability having been supplied at construction
    #[error("Synchronous API unavailable: no synchronous generator configured")]
    SyncUnavailable,
}

impl CacheError {
    /// Wraps an arbitrary error from a caller-supplied transform.
    pub fn codec<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::Codec(Box::new(err))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
