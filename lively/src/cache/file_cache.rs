//! Disk-backed key/value cache with TTL and capacity-bounded eviction.
//!
//! Entries are payload/policy file pairs keyed by `(key, region)`. The
//! cache keeps an approximate aggregate byte size persisted in a sentinel
//! file, sweeps expired entries on a configurable interval, and shrinks
//! itself least-recently-accessed-first when it outgrows its limit.
//!
//! # Concurrency
//!
//! There is no in-process locking around the data files; every call opens
//! and closes its own handles and correctness across threads and processes
//! is delegated to filesystem semantics plus the retry loop in
//! [`sysfile::open_with_retry`]. Maintenance operations coordinate through
//! the advisory [`MaintenanceLock`] and return busy sentinels instead of
//! blocking. Background maintenance is supervised: failures are logged and
//! [`FileCache::drain_maintenance`] awaits completion.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::heap::MinHeap;
use super::lock::MaintenanceLock;
use super::policy::{CachePolicy, Payload, PayloadMode, PayloadSource};
use super::supervisor::MaintenanceSupervisor;
use super::sysfile;

// =============================================================================
// Layout constants
// =============================================================================

/// Sentinel persisting the aggregate cache size.
const SIZE_FILE: &str = "cache.size";

/// Sentinel persisting the last clean timestamp.
const LAST_CLEANED_FILE: &str = "cache.lcd";

/// Subdirectory holding payload files.
const CACHE_SUBDIR: &str = "cache";

/// Subdirectory holding policy files.
const POLICY_SUBDIR: &str = "policy";

/// Payload file extension.
const PAYLOAD_EXT: &str = "dat";

/// Policy file extension.
const POLICY_EXT: &str = "policy";

/// Fraction of the maximum size the automatic shrink aims for, leaving
/// headroom before the next trigger.
const AUTO_SHRINK_FACTOR: f64 = 0.75;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`FileCache`].
#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    /// Root directory of the cache. Created if missing.
    pub root: PathBuf,

    /// Instance name used in logs. Defaults to the root directory name.
    pub name: Option<String>,

    /// Disk budget in bytes. Writes that push the aggregate size past this
    /// emit [`CacheEvent::MaxSizeReached`].
    pub max_cache_size: i64,

    /// Total time to keep retrying a contended file open before the
    /// original error propagates. Zero retries indefinitely.
    pub access_timeout: Duration,

    /// Interval between self-clean sweeps. A sweep is scheduled at
    /// construction when this much time has passed since the last one.
    pub clean_interval: Duration,

    /// How long before expiry a filename payload stays safe to use. Reads
    /// in filename mode treat entries this close to expiry as already
    /// expired so callers never hold a path about to be evicted.
    pub filename_safety_margin: Duration,

    /// How reads interpret payloads. `RawBytes` is rejected at
    /// construction.
    pub payload_read_mode: PayloadMode,

    /// How writes expect payloads to be supplied.
    pub payload_write_mode: PayloadMode,

    /// Recompute the aggregate size in the background at construction even
    /// when a persisted value exists.
    pub calculate_cache_size_on_start: bool,

    /// Automatically shrink to 75% of `max_cache_size` when a write pushes
    /// the cache past its budget.
    pub auto_shrink: bool,

    /// Channel receiving [`CacheEvent`] notifications, registered by the
    /// owner.
    pub events: Option<UnboundedSender<CacheEvent>>,
}

impl FileCacheConfig {
    /// Creates a configuration with defaults for the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            name: None,
            max_cache_size: i64::MAX,
            access_timeout: Duration::ZERO,
            clean_interval: Duration::from_secs(7 * 24 * 60 * 60),
            filename_safety_margin: Duration::from_secs(10 * 60),
            payload_read_mode: PayloadMode::Serializable,
            payload_write_mode: PayloadMode::Serializable,
            calculate_cache_size_on_start: false,
            auto_shrink: true,
            events: None,
        }
    }

    /// Sets the disk budget in bytes.
    pub fn with_max_cache_size(mut self, bytes: i64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Sets the clean interval.
    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    /// Sets the payload read mode.
    pub fn with_read_mode(mut self, mode: PayloadMode) -> Self {
        self.payload_read_mode = mode;
        self
    }

    /// Sets the payload write mode.
    pub fn with_write_mode(mut self, mode: PayloadMode) -> Self {
        self.payload_write_mode = mode;
        self
    }

    /// Registers the event channel.
    pub fn with_events(mut self, events: UnboundedSender<CacheEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enables or disables automatic shrinking.
    pub fn with_auto_shrink(mut self, enabled: bool) -> Self {
        self.auto_shrink = enabled;
        self
    }
}

/// Notifications delivered over the owner-registered event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A write pushed the aggregate size past the configured maximum.
    MaxSizeReached {
        /// Aggregate size after the write, in bytes.
        size: i64,
        /// The configured maximum, in bytes.
        max: i64,
    },

    /// A shrink operation finished.
    Resized {
        /// Aggregate size before the shrink.
        old_size: i64,
        /// Aggregate size after the shrink.
        new_size: i64,
    },
}

// =============================================================================
// Eviction candidates
// =============================================================================

/// Reference to an entry gathered during an eviction scan.
///
/// Ordered by last access time ascending so the stalest entry surfaces
/// first; equally-stale entries order larger-first so each eviction frees
/// the most bytes, with the key as a deterministic final tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheItemReference {
    last_access: SystemTime,
    len: u64,
    key: String,
}

impl CacheItemReference {
    fn gather(cache_path: &Path, policy_path: &Path, key: &str) -> Option<Self> {
        let meta = fs::metadata(cache_path).ok()?;
        let policy_len = fs::metadata(policy_path).map(|m| m.len()).unwrap_or(0);
        let last_access = meta.accessed().or_else(|_| meta.modified()).ok()?;
        Some(Self {
            last_access,
            len: meta.len() + policy_len,
            key: key.to_string(),
        })
    }
}

impl Ord for CacheItemReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.last_access
            .cmp(&other.last_access)
            .then_with(|| other.len.cmp(&self.len))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for CacheItemReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// FileCache
// =============================================================================

/// Disk-backed key/value cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: FileCacheConfig,
    name: String,
    /// Approximate aggregate byte size; 0 means unknown.
    current_size: AtomicI64,
    supervisor: MaintenanceSupervisor,
    /// Handle back to the owning `Arc`, for background tasks.
    weak_self: std::sync::Weak<Inner>,
}

impl FileCache {
    /// Opens (or creates) a cache rooted at `config.root`.
    ///
    /// If the clean interval has elapsed since the last sweep (or no sweep
    /// is on record) an expiry sweep is scheduled in the background;
    /// otherwise the aggregate size is recomputed in the background when
    /// requested or unknown.
    pub fn new(config: FileCacheConfig) -> Result<FileCache, CacheError> {
        if config.payload_read_mode == PayloadMode::RawBytes {
            return Err(CacheError::Config(
                "the read mode cannot be RawBytes; use filename mode to fetch the path"
                    .to_string(),
            ));
        }

        fs::create_dir_all(&config.root)?;

        let name = config.name.clone().unwrap_or_else(|| {
            config
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file-cache".to_string())
        });

        let inner = Arc::new_cyclic(|weak| Inner {
            config,
            name,
            current_size: AtomicI64::new(0),
            supervisor: MaintenanceSupervisor::new(),
            weak_self: weak.clone(),
        });

        if inner.should_clean() {
            let task = Arc::clone(&inner);
            inner.supervisor.spawn("startup-clean", move || {
                match task.clean_cache(None) {
                    Ok(removed) => debug!(cache = %task.name, removed, "Startup clean finished"),
                    Err(err) => warn!(cache = %task.name, error = %err, "Startup clean failed"),
                }
            });
        } else if inner.config.calculate_cache_size_on_start || inner.current_cache_size() == 0 {
            let task = Arc::clone(&inner);
            inner.supervisor.spawn("startup-size", move || {
                if let Err(err) = task.update_cache_size() {
                    warn!(cache = %task.name, error = %err, "Startup size calculation failed");
                }
            });
        }

        info!(cache = %inner.name, root = %inner.config.root.display(), "File cache opened");
        Ok(FileCache { inner })
    }

    /// The cache instance name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// The configured maximum size in bytes.
    pub fn max_cache_size(&self) -> i64 {
        self.inner.config.max_cache_size
    }

    /// The approximate aggregate size of the cache in bytes.
    ///
    /// Kept in sync incrementally by writes and removals; recomputed in
    /// full when unknown. Treat as an approximation, not an invariant.
    pub fn current_cache_size(&self) -> i64 {
        self.inner.current_cache_size()
    }

    /// Reads an entry per the configured read mode.
    ///
    /// Expired entries (including the filename safety margin in filename
    /// read mode) are removed and read as `None`. A successful read of an
    /// entry with sliding expiration rewrites its policy file with the
    /// extended deadline. Corrupt entries degrade to misses.
    pub fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<Payload<T>>, CacheError> {
        self.inner.get(key, region, self.inner.config.payload_read_mode)
    }

    /// Reads and deserializes an entry, regardless of the configured read
    /// mode.
    pub fn get_object<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<T>, CacheError> {
        Ok(self
            .inner
            .get(key, region, PayloadMode::Serializable)?
            .and_then(Payload::into_object))
    }

    /// Reads an entry as its internal payload path. The path stays valid
    /// for at least the configured filename safety margin.
    pub fn get_filename(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<PathBuf>, CacheError> {
        Ok(self
            .inner
            .get::<()>(key, region, PayloadMode::Filename)?
            .and_then(Payload::into_file))
    }

    /// Writes an entry, returning the previous payload if one existed and
    /// was readable.
    ///
    /// The payload variant must match the configured write mode. The new
    /// value and policy are always written, whatever the previous state.
    pub fn add_or_get_existing<T: Serialize + DeserializeOwned>(
        &self,
        key: &str,
        value: PayloadSource<'_, T>,
        policy: CachePolicy,
        region: Option<&str>,
    ) -> Result<Option<Payload<T>>, CacheError> {
        self.inner.check_write_mode(&value)?;

        let previous = if self.contains(key, region)? {
            self.get(key, region).unwrap_or(None)
        } else {
            None
        };

        self.inner.write_entry(key, region, Some(value), &policy)?;
        Ok(previous)
    }

    /// Writes an entry, discarding any previous value.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: PayloadSource<'_, T>,
        policy: CachePolicy,
        region: Option<&str>,
    ) -> Result<(), CacheError> {
        self.inner.check_write_mode(&value)?;
        self.inner.write_entry(key, region, Some(value), &policy)
    }

    /// Deletes an entry, returning its payload if it was readable.
    ///
    /// Racing deletes are benign: a file already gone counts as removed.
    pub fn remove<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<Payload<T>>, CacheError> {
        if !self.contains(key, region)? {
            return Ok(None);
        }
        let previous = self
            .inner
            .read_payload(key, region, self.inner.config.payload_read_mode)
            .unwrap_or(None);
        self.inner.remove_entry_files(key, region);
        Ok(previous)
    }

    /// True if the entry's payload file exists.
    pub fn contains(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        Ok(self.inner.cache_path(key, region)?.exists())
    }

    /// Lazily enumerates the keys in a region.
    ///
    /// This is a single directory pass, not a snapshot; concurrent
    /// mutation during enumeration behaves however the underlying readdir
    /// does.
    pub fn keys(&self, region: Option<&str>) -> impl Iterator<Item = String> {
        let dir = region_dir(&self.inner.config.root, CACHE_SUBDIR, region);
        read_keys(dir)
    }

    /// Number of entries in a region.
    pub fn get_count(&self, region: Option<&str>) -> usize {
        self.keys(region).count()
    }

    /// Returns the policy attached to an entry, or the default policy when
    /// the entry or its policy is missing or unreadable.
    pub fn get_policy(&self, key: &str, region: Option<&str>) -> CachePolicy {
        self.inner
            .read_policy(key, region)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Sweeps expired entries from a region (the default region when
    /// `None`).
    ///
    /// Returns the number of bytes removed, or 0 without doing anything
    /// when another maintenance operation holds the lock. Per-entry
    /// failures are skipped, not fatal.
    pub fn clean_cache(&self, region: Option<&str>) -> Result<u64, CacheError> {
        self.inner.clean_cache(region)
    }

    /// Evicts least-recently-accessed entries until the region's size is
    /// at most `target_bytes`.
    ///
    /// Returns the resulting size, or -1 without doing anything when
    /// another maintenance operation holds the lock.
    pub fn shrink_to_size(
        &self,
        target_bytes: i64,
        region: Option<&str>,
    ) -> Result<i64, CacheError> {
        self.inner.shrink_to_size(target_bytes, region)
    }

    /// Deletes every entry not accessed since `min_date` and recomputes
    /// the aggregate size.
    ///
    /// Returns false without doing anything when another maintenance
    /// operation holds the lock.
    pub fn flush_before(
        &self,
        min_date: DateTime<Utc>,
        region: Option<&str>,
    ) -> Result<bool, CacheError> {
        self.inner.flush_before(min_date, region)
    }

    /// Deletes every entry, region-scoped. Equivalent to
    /// [`flush_before`](Self::flush_before) with the current time.
    pub fn flush(&self, region: Option<&str>) -> Result<bool, CacheError> {
        self.inner.flush_before(Utc::now(), region)
    }

    /// Removes every entry in a region.
    ///
    /// Returns false without doing anything when another maintenance
    /// operation holds the lock.
    pub fn clear_region(&self, region: &str) -> Result<bool, CacheError> {
        self.inner.clear_region(region)
    }

    /// Recomputes the aggregate size by directory traversal and persists
    /// it.
    pub fn update_cache_size(&self) -> Result<i64, CacheError> {
        self.inner.update_cache_size()
    }

    /// Recomputes the aggregate size in the background.
    pub fn update_cache_size_async(&self) {
        let task = Arc::clone(&self.inner);
        self.inner.supervisor.spawn("update-size", move || {
            if let Err(err) = task.update_cache_size() {
                warn!(cache = %task.name, error = %err, "Background size calculation failed");
            }
        });
    }

    /// Runs a clean sweep in the background.
    pub fn clean_cache_async(&self) {
        let task = Arc::clone(&self.inner);
        self.inner.supervisor.spawn("clean", move || {
            match task.clean_cache(None) {
                Ok(removed) => debug!(cache = %task.name, removed, "Background clean finished"),
                Err(err) => warn!(cache = %task.name, error = %err, "Background clean failed"),
            }
        });
    }

    /// Blocks until all background maintenance scheduled so far completes.
    pub fn drain_maintenance(&self) {
        self.inner.supervisor.drain();
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("name", &self.inner.name)
            .field("root", &self.inner.config.root)
            .field("current_size", &self.inner.current_size)
            .finish()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl Inner {
    fn check_write_mode<T>(&self, source: &PayloadSource<'_, T>) -> Result<(), CacheError> {
        let mode = source.mode();
        if mode != self.config.payload_write_mode {
            return Err(CacheError::Config(format!(
                "payload supplied as {mode:?} but the write mode is {:?}",
                self.config.payload_write_mode
            )));
        }
        Ok(())
    }

    fn cache_path(&self, key: &str, region: Option<&str>) -> Result<PathBuf, CacheError> {
        entry_path(&self.config.root, CACHE_SUBDIR, region, key, PAYLOAD_EXT)
    }

    fn policy_path(&self, key: &str, region: Option<&str>) -> Result<PathBuf, CacheError> {
        entry_path(&self.config.root, POLICY_SUBDIR, region, key, POLICY_EXT)
    }

    fn read_policy(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CachePolicy>, CacheError> {
        let path = self.policy_path(key, region)?;
        sysfile::read(&path, self.config.access_timeout)
    }

    fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
        mode: PayloadMode,
    ) -> Result<Option<Payload<T>>, CacheError> {
        let cache_path = self.cache_path(key, region)?;
        if !cache_path.exists() {
            return Ok(None);
        }

        // A missing or corrupt policy makes the entry's lifetime unknowable;
        // treat it as expired.
        let policy = match self.read_policy(key, region)? {
            Some(policy) => policy,
            None => {
                debug!(cache = %self.name, key, "Entry has no readable policy, removing");
                self.remove_entry_files(key, region);
                return Ok(None);
            }
        };

        let mut cutoff = Utc::now();
        if mode == PayloadMode::Filename {
            cutoff = cutoff
                + chrono::Duration::from_std(self.config.filename_safety_margin)
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }

        if policy.is_expired_at(cutoff) {
            self.remove_entry_files(key, region);
            return Ok(None);
        }

        let payload = match self.read_payload_file(&cache_path, key, region, mode)? {
            Some(payload) => payload,
            None => return Ok(None),
        };

        // Sliding expiration: push the deadline forward and rewrite only
        // the policy file.
        if let Some(slid) = policy.slide(Utc::now()) {
            self.write_entry::<()>(key, region, None, &slid)?;
        }

        Ok(Some(payload))
    }

    fn read_payload<T: DeserializeOwned>(
        &self,
        key: &str,
        region: Option<&str>,
        mode: PayloadMode,
    ) -> Result<Option<Payload<T>>, CacheError> {
        let cache_path = self.cache_path(key, region)?;
        if !cache_path.exists() {
            return Ok(None);
        }
        self.read_payload_file(&cache_path, key, region, mode)
    }

    fn read_payload_file<T: DeserializeOwned>(
        &self,
        cache_path: &Path,
        key: &str,
        region: Option<&str>,
        mode: PayloadMode,
    ) -> Result<Option<Payload<T>>, CacheError> {
        match mode {
            PayloadMode::Filename => Ok(Some(Payload::File(cache_path.to_path_buf()))),
            PayloadMode::RawBytes => Err(CacheError::RawReadUnsupported),
            PayloadMode::Serializable => {
                let mut options = OpenOptions::new();
                options.read(true);
                let mut file = match sysfile::open_with_retry(
                    cache_path,
                    &options,
                    self.config.access_timeout,
                ) {
                    Ok(file) => file,
                    Err(CacheError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                        return Ok(None)
                    }
                    Err(err) => return Err(err),
                };
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;

                match sysfile::decode::<T>(&buf) {
                    Some(value) => Ok(Some(Payload::Object(value))),
                    None => {
                        // A payload that no longer deserializes is a miss;
                        // drop the damaged entry so it can be repopulated.
                        warn!(cache = %self.name, key, "Corrupt payload, removing entry");
                        self.remove_entry_files(key, region);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Central write path. `value` of `None` rewrites only the policy file
    /// (sliding-expiration refresh); the aggregate size then nets to the
    /// policy-file delta alone.
    fn write_entry<T: Serialize>(
        &self,
        key: &str,
        region: Option<&str>,
        value: Option<PayloadSource<'_, T>>,
        policy: &CachePolicy,
    ) -> Result<(), CacheError> {
        let cache_path = self.cache_path(key, region)?;
        let policy_path = self.policy_path(key, region)?;

        if let Some(value) = value {
            let old_len = file_len(&cache_path) as i64;

            match value {
                PayloadSource::Object(obj) => {
                    let buf = sysfile::encode(obj)?;
                    self.write_bytes(&cache_path, &buf)?;
                }
                PayloadSource::Bytes(bytes) => {
                    self.write_bytes(&cache_path, bytes)?;
                }
                PayloadSource::Reader(reader) => {
                    let mut options = OpenOptions::new();
                    options.write(true).create(true).truncate(true);
                    let mut file = sysfile::open_with_retry(
                        &cache_path,
                        &options,
                        self.config.access_timeout,
                    )?;
                    std::io::copy(reader, &mut file)?;
                }
                PayloadSource::File(source) => {
                    fs::copy(source, &cache_path)?;
                }
            }

            let new_len = file_len(&cache_path) as i64;
            self.adjust_size(new_len - old_len);
        }

        let old_policy_len = file_len(&policy_path) as i64;
        sysfile::write(&policy_path, policy, self.config.access_timeout)?;
        let new_policy_len = file_len(&policy_path) as i64;
        self.adjust_size(new_policy_len - old_policy_len);

        let size = self.current_cache_size();
        if size > self.config.max_cache_size {
            self.on_max_size_reached(size);
        }

        Ok(())
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        use std::io::Write;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let mut file = sysfile::open_with_retry(path, &options, self.config.access_timeout)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn on_max_size_reached(&self, size: i64) {
        let max = self.config.max_cache_size;
        debug!(cache = %self.name, size, max, "Cache exceeded maximum size");
        self.emit(CacheEvent::MaxSizeReached { size, max });

        if self.config.auto_shrink {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            // Shrink below the limit so there is room to grow before the
            // next trigger.
            let target = (max as f64 * AUTO_SHRINK_FACTOR) as i64;
            self.supervisor.spawn("auto-shrink", move || {
                match this.shrink_to_size(target, None) {
                    Ok(-1) => debug!(cache = %this.name, "Auto-shrink skipped, maintenance busy"),
                    Ok(new_size) => info!(cache = %this.name, new_size, "Auto-shrink finished"),
                    Err(err) => warn!(cache = %this.name, error = %err, "Auto-shrink failed"),
                }
            });
        }
    }

    /// Removes an entry's files, decrementing the aggregate size by each
    /// file's measured length. Races with other removers are benign.
    fn remove_entry_files(&self, key: &str, region: Option<&str>) {
        for path in [
            self.cache_path(key, region).ok(),
            self.policy_path(key, region).ok(),
        ]
        .into_iter()
        .flatten()
        {
            match fs::metadata(&path) {
                Ok(meta) => {
                    self.adjust_size(-(meta.len() as i64));
                    if let Err(err) = fs::remove_file(&path) {
                        // Another thread or process won the race; fine.
                        debug!(cache = %self.name, path = %path.display(), error = %err,
                               "Entry file already gone");
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn current_cache_size(&self) -> i64 {
        let size = self.current_size.load(Ordering::Acquire);
        if size != 0 {
            return size;
        }
        // First query: load the persisted value if there is one.
        let persisted: Option<i64> = sysfile::read(
            &self.config.root.join(SIZE_FILE),
            self.config.access_timeout,
        )
        .ok()
        .flatten();
        if let Some(value) = persisted {
            self.current_size.store(value, Ordering::Release);
            value
        } else {
            0
        }
    }

    fn adjust_size(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let base = self.current_cache_size();
        self.store_size((base + delta).max(0));
    }

    fn store_size(&self, value: i64) {
        self.current_size.store(value, Ordering::Release);
        if let Err(err) = sysfile::write(
            &self.config.root.join(SIZE_FILE),
            &value,
            self.config.access_timeout,
        ) {
            // The size is approximate and self-correcting; failing to
            // persist it must not fail the write that triggered it.
            warn!(cache = %self.name, error = %err, "Failed to persist cache size");
        }
    }

    fn should_clean(&self) -> bool {
        let last: Option<DateTime<Utc>> = sysfile::read(
            &self.config.root.join(LAST_CLEANED_FILE),
            self.config.access_timeout,
        )
        .ok()
        .flatten();
        match last {
            Some(when) => {
                let elapsed = Utc::now().signed_duration_since(when);
                elapsed.to_std().map(|e| e >= self.config.clean_interval).unwrap_or(true)
            }
            None => true,
        }
    }

    fn clean_cache(&self, region: Option<&str>) -> Result<u64, CacheError> {
        let _lock = match MaintenanceLock::try_acquire(&self.config.root) {
            Some(lock) => lock,
            None => return Ok(0),
        };

        let now = Utc::now();
        let mut removed = 0u64;
        let dir = region_dir(&self.config.root, CACHE_SUBDIR, region);
        for key in read_keys(dir) {
            let expired = match self.read_policy(&key, region) {
                Ok(Some(policy)) => policy.is_expired_at(now),
                // No readable policy: lifetime unknowable, reclaim it.
                Ok(None) | Err(_) => true,
            };
            if !expired {
                continue;
            }

            let cache_path = match self.cache_path(&key, region) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let policy_path = match self.policy_path(&key, region) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(item) = CacheItemReference::gather(&cache_path, &policy_path, &key) {
                self.remove_entry_files(&key, region);
                removed += item.len;
            }
        }

        if let Err(err) = sysfile::write(
            &self.config.root.join(LAST_CLEANED_FILE),
            &now,
            self.config.access_timeout,
        ) {
            warn!(cache = %self.name, error = %err, "Failed to record clean timestamp");
        }

        debug!(cache = %self.name, removed, "Clean sweep finished");
        Ok(removed)
    }

    fn shrink_to_size(&self, target_bytes: i64, region: Option<&str>) -> Result<i64, CacheError> {
        let _lock = match MaintenanceLock::try_acquire(&self.config.root) {
            Some(lock) => lock,
            None => return Ok(-1),
        };

        let original_size = if region.is_none() {
            let mut size = self.current_cache_size();
            if size == 0 {
                size = self.compute_cache_size(None)?;
                self.store_size(size);
            }
            size
        } else {
            self.compute_cache_size(region)?
        };

        let amount = original_size - target_bytes;
        let removed = self.delete_oldest(amount, region);
        let new_size = original_size - removed;

        self.emit(CacheEvent::Resized {
            old_size: original_size,
            new_size,
        });

        info!(cache = %self.name, original_size, new_size, "Shrink finished");
        Ok(new_size)
    }

    /// Deletes least-recently-accessed entries until `amount` bytes are
    /// freed or the region is exhausted. Returns the bytes actually freed.
    fn delete_oldest(&self, amount: i64, region: Option<&str>) -> i64 {
        if amount <= 0 {
            return 0;
        }

        let dir = region_dir(&self.config.root, CACHE_SUBDIR, region);
        let mut candidates = Vec::new();
        for key in read_keys(dir) {
            let cache_path = match self.cache_path(&key, region) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let policy_path = match self.policy_path(&key, region) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if let Some(item) = CacheItemReference::gather(&cache_path, &policy_path, &key) {
                candidates.push(item);
            }
        }

        let mut heap = MinHeap::from_unsorted(candidates);
        let mut removed = 0i64;
        while removed < amount {
            let oldest = match heap.pop() {
                Some(item) => item,
                None => break,
            };
            self.remove_entry_files(&oldest.key, region);
            removed += oldest.len as i64;
        }
        removed
    }

    fn flush_before(&self, min_date: DateTime<Utc>, region: Option<&str>) -> Result<bool, CacheError> {
        let _lock = match MaintenanceLock::try_acquire(&self.config.root) {
            Some(lock) => lock,
            None => return Ok(false),
        };

        for subdir in [CACHE_SUBDIR, POLICY_SUBDIR] {
            let dir = region_dir(&self.config.root, subdir, region);
            flush_dir(&dir, min_date);
        }

        let size = self.compute_cache_size(None)?;
        self.store_size(size);
        Ok(true)
    }

    fn clear_region(&self, region: &str) -> Result<bool, CacheError> {
        let _lock = match MaintenanceLock::try_acquire(&self.config.root) {
            Some(lock) => lock,
            None => return Ok(false),
        };

        let dir = region_dir(&self.config.root, CACHE_SUBDIR, Some(region));
        for key in read_keys(dir).collect::<Vec<_>>() {
            self.remove_entry_files(&key, Some(region));
        }
        Ok(true)
    }

    fn update_cache_size(&self) -> Result<i64, CacheError> {
        let size = self.compute_cache_size(None)?;
        self.store_size(size);
        debug!(cache = %self.name, size, "Cache size recomputed");
        Ok(size)
    }

    fn compute_cache_size(&self, region: Option<&str>) -> Result<i64, CacheError> {
        let mut size = 0i64;
        for subdir in [CACHE_SUBDIR, POLICY_SUBDIR] {
            let dir = region_dir(&self.config.root, subdir, region);
            size += dir_size(&dir);
        }
        Ok(size)
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.config.events {
            let _ = tx.send(event);
        }
    }
}

// =============================================================================
// Path and directory helpers
// =============================================================================

/// Directory for a region within a subtree (`cache/` or `policy/`).
fn region_dir(root: &Path, subdir: &str, region: Option<&str>) -> PathBuf {
    match region {
        Some(region) if !region.is_empty() => root.join(subdir).join(region),
        _ => root.join(subdir),
    }
}

/// Full path for an entry file, creating parent directories as needed.
/// Keys are sanitized by stripping any existing extension before the
/// cache's own extension is appended.
fn entry_path(
    root: &Path,
    subdir: &str,
    region: Option<&str>,
    key: &str,
    ext: &str,
) -> Result<PathBuf, CacheError> {
    let dir = region_dir(root, subdir, region);
    fs::create_dir_all(&dir)?;
    let stem = Path::new(key)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| key.to_string());
    Ok(dir.join(format!("{stem}.{ext}")))
}

/// Lazy iterator over the keys (file stems) in a directory.
fn read_keys(dir: PathBuf) -> impl Iterator<Item = String> {
    fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Total size of all files under `dir`, recursively.
fn dir_size(dir: &Path) -> i64 {
    let mut size = 0i64;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            size += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            size += meta.len() as i64;
        }
    }
    size
}

/// Deletes files under `dir` (recursively) last accessed before `min_date`.
fn flush_dir(dir: &Path, min_date: DateTime<Utc>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            flush_dir(&path, min_date);
            continue;
        }
        let accessed = entry
            .metadata()
            .and_then(|m| m.accessed().or_else(|_| m.modified()))
            .map(DateTime::<Utc>::from);
        if let Ok(accessed) = accessed {
            if accessed < min_date {
                if let Err(err) = fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %err, "Flush skipped file");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
