//! Cache Module
//!
//! Disk-backed storage for byte payloads with TTL-based eviction delegated
//! to the queue, plus a typed value-encoding layer on top.

mod codec;
mod store;

// Re-export public types
pub use codec::{CodecCache, CodecCacheBuilder, DecodeFn, EncodeFn, GenerateAsyncFn, GenerateFn};
pub use store::{ErrorSink, FileCache, FileCacheBuilder};

// == Public Constants ==
/// Length of a hashed filename: SHA-256, lowercase hex
pub const HASH_HEX_LEN: usize = 64;
