//! Disk-backed object cache with TTL expiry and LRU eviction.
//!
//! The [`FileCache`] stores each entry as a payload/policy file pair under a
//! configurable root directory, partitioned into regions. Reads enforce the
//! entry's expiration policy, writes keep an approximate aggregate byte size
//! persisted beside the data, and maintenance operations (clean, shrink,
//! flush) coordinate across threads and processes through a best-effort
//! advisory lock file.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/cache.size                    # persisted aggregate size
//! <root>/cache.lcd                     # last clean timestamp
//! <root>/cache.sem                     # advisory maintenance lock
//! <root>/cache/<region>/<key>.dat      # payload
//! <root>/policy/<region>/<key>.policy  # expiration policy
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lively::cache::{FileCache, FileCacheConfig, CachePolicy, PayloadSource};
//! use chrono::{Duration, Utc};
//!
//! let cache = FileCache::new(FileCacheConfig::new("/tmp/my-cache"))?;
//! let policy = CachePolicy::expires_at(Utc::now() + Duration::minutes(10));
//! cache.set("answer", PayloadSource::Object(&42u32), policy, None)?;
//! let value: Option<u32> = cache.get_object("answer", None)?;
//! ```

mod error;
mod file_cache;
mod heap;
mod lock;
mod policy;
mod supervisor;
mod sysfile;

pub use error::CacheError;
pub use file_cache::{CacheEvent, FileCache, FileCacheConfig};
pub use heap::MinHeap;
pub use lock::MaintenanceLock;
pub use policy::{CachePolicy, Payload, PayloadMode, PayloadSource};
