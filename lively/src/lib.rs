//! Lively - live collections and a persistent file cache
//!
//! This library provides the two data-layer building blocks behind API-fed
//! list UIs:
//!
//! - [`collections::TrackingCollection`] ingests an asynchronous, unordered
//!   stream of entities and maintains a stably sorted, optionally filtered
//!   projection of them, delivering minimal add/move/remove diffs to
//!   subscribers while remaining directly mutable from any thread.
//! - [`cache::FileCache`] is a disk-backed key/value store with TTL expiry,
//!   LRU-based shrink-to-size eviction, crash-tolerant aggregate size
//!   bookkeeping, and an advisory cross-process maintenance lock.
//!
//! The two halves are independent: the cache is pulled by callers needing
//! disk-backed storage, the collection is pushed to by an item source.

pub mod cache;
pub mod collections;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
