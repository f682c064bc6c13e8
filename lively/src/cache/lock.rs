//! Advisory maintenance lock.
//!
//! Cache-wide maintenance (clean, shrink, flush) must not run concurrently
//! from multiple threads or processes. The lock is a sentinel file created
//! with `O_EXCL` semantics: whoever creates `cache.sem` holds the lock, and
//! removing it on drop releases it. This is cooperative and best-effort:
//! non-blocking, non-fair, and only honored by participants that ask.
//! Callers that need maintenance to definitely run must retry.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Name of the lock sentinel inside the cache root.
pub(crate) const LOCK_FILE: &str = "cache.sem";

/// Held while a maintenance operation is in progress. Dropping the guard
/// releases the lock.
#[derive(Debug)]
pub struct MaintenanceLock {
    path: PathBuf,
}

impl MaintenanceLock {
    /// Attempts to acquire the maintenance lock for the cache rooted at
    /// `root`. Returns `None` when another thread or process holds it.
    pub fn try_acquire(root: &Path) -> Option<MaintenanceLock> {
        let path = root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Some(MaintenanceLock { path }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => None,
            Err(err) => {
                // Treat an unreadable/uncreatable lock as held; maintenance
                // is optional and callers retry later.
                warn!(path = %path.display(), error = %err, "Failed to probe maintenance lock");
                None
            }
        }
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Failed to release maintenance lock");
        }
    }
}
