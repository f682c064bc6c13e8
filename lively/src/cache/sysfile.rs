//! Versioned binary envelopes and contended file access.
//!
//! Every file the cache owns the format of (the size and last-cleaned
//! sysfiles, policy files, and serialized payloads) is written as a small
//! envelope: a 4-byte magic, a format version byte, then the bincode body.
//! A missing magic or unknown version reads back as `None`, so stale or
//! corrupt files degrade to cache misses instead of failing callers.
//!
//! File opens go through [`open_with_retry`], which absorbs transient
//! sharing violations with a fixed backoff up to the configured access
//! timeout.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::CacheError;

/// Magic prefix identifying files written by this cache.
const MAGIC: &[u8; 4] = b"LVFC";

/// Current envelope format version.
const FORMAT_VERSION: u8 = 1;

/// Fixed pause between open attempts while a file is contended.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Opens a file, retrying transient I/O failures.
///
/// A missing file is reported immediately; any other I/O error is retried
/// on a fixed 50ms backoff until `timeout` is exhausted, at which point the
/// original error propagates. A zero `timeout` retries indefinitely.
pub(crate) fn open_with_retry(
    path: &Path,
    options: &OpenOptions,
    timeout: Duration,
) -> Result<File, CacheError> {
    let mut waited = Duration::ZERO;
    loop {
        match options.open(path) {
            Ok(file) => return Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(err.into()),
            Err(err) => {
                if !timeout.is_zero() && waited >= timeout {
                    return Err(err.into());
                }
                std::thread::sleep(RETRY_INTERVAL);
                waited += RETRY_INTERVAL;
            }
        }
    }
}

/// Serializes `value` into the envelope format and writes it to `path`,
/// truncating any previous content.
pub(crate) fn write<T: Serialize>(
    path: &Path,
    value: &T,
    timeout: Duration,
) -> Result<(), CacheError> {
    let body = bincode::serialize(value).map_err(|e| CacheError::Serialize(e.to_string()))?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    let mut file = open_with_retry(path, &options, timeout)?;
    file.write_all(MAGIC)?;
    file.write_all(&[FORMAT_VERSION])?;
    file.write_all(&body)?;
    Ok(())
}

/// Reads and deserializes an envelope file.
///
/// Returns `None` when the file does not exist, carries the wrong magic or
/// version, or fails to deserialize. Corruption is a miss, not an error.
pub(crate) fn read<T: DeserializeOwned>(
    path: &Path,
    timeout: Duration,
) -> Result<Option<T>, CacheError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut options = OpenOptions::new();
    options.read(true);
    let mut file = match open_with_retry(path, &options, timeout) {
        Ok(file) => file,
        Err(CacheError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(decode(&buf))
}

/// Decodes an envelope from a byte buffer, `None` on any mismatch.
pub(crate) fn decode<T: DeserializeOwned>(buf: &[u8]) -> Option<T> {
    if buf.len() < MAGIC.len() + 1 || &buf[..MAGIC.len()] != MAGIC {
        return None;
    }
    if buf[MAGIC.len()] != FORMAT_VERSION {
        return None;
    }
    bincode::deserialize(&buf[MAGIC.len() + 1..]).ok()
}

/// Serializes `value` into an envelope byte buffer.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    let body = bincode::serialize(value).map_err(|e| CacheError::Serialize(e.to_string()))?;
    let mut buf = Vec::with_capacity(MAGIC.len() + 1 + body.len());
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&body);
    Ok(buf)
}
