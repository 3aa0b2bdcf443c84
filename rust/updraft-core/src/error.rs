//! Error types for the update-trust protocol.
//!
//! Every authenticity, consistency, and freshness check fails closed with a
//! dedicated variant so callers can tell "the mirror tried something" apart
//! from "the network is down".

use crate::metadata::RoleType;
use std::path::{Path, PathBuf};

/// Convenience alias used throughout the crate.
pub type Result<T, E = TufError> = std::result::Result<T, E>;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised by a [`Fetcher`](crate::fetch::Fetcher) implementation.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The remote resource does not exist (HTTP 403/404 or a missing file).
    #[error("not found: {0}")]
    NotFound(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} while fetching {url}")]
    Http { url: String, status: u16 },

    /// Connection, TLS, timeout, or read failure.
    #[error("transport error while fetching {url}: {reason}")]
    Transport { url: String, reason: String },

    /// The body is larger than the caller allowed.
    #[error("{url} exceeds the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },

    /// Scheme other than http, https, or file.
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// Errors that can occur while authoring, refreshing, or downloading.
#[derive(Debug, thiserror::Error)]
pub enum TufError {
    /// Structurally invalid metadata (missing fields, bad version, duplicate keys...).
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A signature could not be checked at all (e.g. the role is undefined).
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// Not enough distinct authorized signatures.
    #[error("{role} threshold not met: need {required}, got {valid}")]
    ThresholdNotMet {
        role: RoleType,
        required: u32,
        valid: u32,
    },

    /// A version went backwards.
    #[error("{role} rollback detected: trusted version {current}, got {received}")]
    RollbackDetected {
        role: RoleType,
        current: u64,
        received: u64,
    },

    /// Metadata is past its expiry date.
    #[error("{role} metadata expired at {expires}")]
    MetadataExpired { role: RoleType, expires: String },

    /// Pinned versions or hashes do not match what was served.
    #[error("inconsistent metadata: {0}")]
    Consistency(String),

    /// Downloaded target bytes do not match the targets metadata.
    #[error("integrity check failed for '{target}': {reason}")]
    Integrity { target: String, reason: String },

    /// Trust-on-first-use could not obtain an initial root.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Transport failure while fetching metadata or a target.
    #[error("network error: {0}")]
    Network(#[from] FetchError),

    /// Wrong passphrase or tampered private key blob.
    #[error("cannot decrypt private key: {0}")]
    Decryption(String),

    /// Root rotation cannot proceed.
    #[error("root rotation failed: {0}")]
    Rotation(String),

    /// The target path is not listed in the trusted targets metadata.
    #[error("target not found: {0}")]
    TargetNotFound(String),

    /// No trusted root exists locally yet.
    #[error("no trusted root at {0}; run trust-on-first-use first")]
    NotBootstrapped(PathBuf),

    /// Another authoring process holds the repository lock.
    #[error("repository is locked by another process ({0})")]
    Locked(PathBuf),

    /// The caller aborted an in-flight download.
    #[error("download cancelled")]
    Cancelled,

    /// Local serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TufError {
    /// True for rejections that indicate tampered, stale, or inconsistent
    /// data. These must never be downgraded to warnings.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            TufError::MalformedMetadata(_)
                | TufError::SignatureInvalid(_)
                | TufError::ThresholdNotMet { .. }
                | TufError::RollbackDetected { .. }
                | TufError::MetadataExpired { .. }
                | TufError::Consistency(_)
                | TufError::Integrity { .. }
        )
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        TufError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Attach the offending path to an `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| TufError::io(path, e))
    }
}

// =============================================================================
// Tests
// =============================================================================
