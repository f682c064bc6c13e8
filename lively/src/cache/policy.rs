//! Cache entry policies and payload handling modes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Expiration policy attached to every cache entry.
///
/// Persisted beside the payload in the entry's `.policy` file. An absent
/// `absolute_expiration` means the entry never expires on its own; a
/// non-zero `sliding_expiration` pushes the absolute expiration forward on
/// every successful read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Point in time after which the entry is expired.
    pub absolute_expiration: Option<DateTime<Utc>>,

    /// Window by which a successful read extends `absolute_expiration`.
    /// Zero disables sliding behavior.
    pub sliding_expiration: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: Duration::ZERO,
        }
    }
}

impl CachePolicy {
    /// Policy that expires at a fixed point in time.
    pub fn expires_at(when: DateTime<Utc>) -> Self {
        Self {
            absolute_expiration: Some(when),
            sliding_expiration: Duration::ZERO,
        }
    }

    /// Policy whose expiration is pushed `window` past every read.
    ///
    /// The initial absolute expiration is `now + window`.
    pub fn sliding(window: Duration) -> Self {
        Self {
            absolute_expiration: Some(
                Utc::now() + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            sliding_expiration: window,
        }
    }

    /// True if the entry is expired relative to `cutoff`.
    pub fn is_expired_at(&self, cutoff: DateTime<Utc>) -> bool {
        match self.absolute_expiration {
            Some(when) => when < cutoff,
            None => false,
        }
    }

    /// Applies sliding expiration: returns the refreshed policy, or `None`
    /// when this policy does not slide.
    pub(crate) fn slide(&self, now: DateTime<Utc>) -> Option<CachePolicy> {
        if self.sliding_expiration.is_zero() {
            return None;
        }
        let window = chrono::Duration::from_std(self.sliding_expiration).ok()?;
        Some(CachePolicy {
            absolute_expiration: Some(now + window),
            sliding_expiration: self.sliding_expiration,
        })
    }
}

/// How the cache treats entry payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// The payload is a serializable object, stored in the versioned
    /// binary envelope.
    Serializable,

    /// The payload is a file: content is copied into the cache on write,
    /// and reads return the internal storage path rather than content.
    Filename,

    /// The payload is raw bytes (a buffer or a readable stream). Write
    /// only; reading back in this mode is unsupported.
    RawBytes,
}

/// What a read returns, depending on the configured read mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    /// Deserialized payload content (Serializable read mode).
    Object(T),

    /// Path to the payload file inside the cache (Filename read mode).
    /// Callers must finish with the file within the cache's filename
    /// safety margin, after which the entry may expire or be evicted.
    File(PathBuf),
}

impl<T> Payload<T> {
    /// Unwraps the deserialized object, discarding a file payload.
    pub fn into_object(self) -> Option<T> {
        match self {
            Payload::Object(v) => Some(v),
            Payload::File(_) => None,
        }
    }

    /// Unwraps the payload file path, discarding an object payload.
    pub fn into_file(self) -> Option<PathBuf> {
        match self {
            Payload::Object(_) => None,
            Payload::File(p) => Some(p),
        }
    }
}

/// What writes accept. The variant must agree with the cache's configured
/// write mode.
pub enum PayloadSource<'a, T> {
    /// Serialize the object into the entry (Serializable write mode).
    Object(&'a T),

    /// Store the buffer verbatim (RawBytes write mode).
    Bytes(&'a [u8]),

    /// Drain the reader into the entry (RawBytes write mode). The reader
    /// is not closed; the caller still owns it.
    Reader(&'a mut dyn Read),

    /// Copy the file at this path into the entry (Filename write mode).
    File(&'a Path),
}

impl<T> PayloadSource<'_, T> {
    /// The payload mode this source belongs to.
    pub(crate) fn mode(&self) -> PayloadMode {
        match self {
            PayloadSource::Object(_) => PayloadMode::Serializable,
            PayloadSource::Bytes(_) | PayloadSource::Reader(_) => PayloadMode::RawBytes,
            PayloadSource::File(_) => PayloadMode::Filename,
        }
    }
}
