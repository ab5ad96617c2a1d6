//! fscache - a disk-backed byte cache with TTL eviction
//!
//! Payloads are stored as flat files named by the SHA-256 of their key and
//! expire after a fixed duration of inactivity; reads and writes refresh
//! the clock. Expiration is tracked by an in-memory queue that keeps a
//! single live timer armed for the earliest deadline, so eviction work
//! scales with evictions, not with entries.

pub mod cache;
pub mod config;
pub mod error;
pub mod queue;

pub use cache::{CodecCache, CodecCacheBuilder, FileCache, FileCacheBuilder};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use queue::{ExpiryQueue, QueueEntry};
