//! Queue Module
//!
//! The TTL-ordered eviction queue: an in-memory index tracking the exact
//! expiration instant of every cached key, evicting expired keys with a
//! single scheduled timer.

mod entry;
mod fifo;


// Re-export public types
pub use fifo::{Entries, EvictFn, ExpiryQueue, QueueEntry};
