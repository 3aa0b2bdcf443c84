//! Transport, progress, and cancellation for metadata and target fetches.
//!
//! The [`Fetcher`] trait is the only place bytes enter the client. The
//! shipped implementation, [`HttpFetcher`], speaks HTTP(S) through a blocking
//! `reqwest` client and serves `file://` URLs straight from disk, which is
//! how local repositories and tests are read.

use crate::error::{FetchError, IoContext, Result, TufError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Transport
// =============================================================================

/// Opens a URL for streaming.
pub trait Fetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError>;

    /// Size of each read while streaming a target.
    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }
}

/// Read a whole resource, failing once it exceeds `max_length` bytes.
pub fn fetch_bytes(
    fetcher: &dyn Fetcher,
    url: &str,
    max_length: u64,
) -> Result<Vec<u8>, FetchError> {
    let reader = fetcher.open(url)?;
    let mut bytes = Vec::new();
    reader
        .take(max_length + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    if bytes.len() as u64 > max_length {
        return Err(FetchError::TooLarge {
            url: url.to_string(),
            limit: max_length,
        });
    }
    Ok(bytes)
}

/// HTTP(S) and `file://` fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    chunk_size: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, chunk_size: usize) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            chunk_size: chunk_size.max(1),
        })
    }

    fn open_file(url: &str, rest: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        let decoded = urlencoding::decode(rest)
            .map_err(|_| FetchError::UnsupportedUrl(url.to_string()))?;
        let path = Path::new(decoded.as_ref());
        match File::open(path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(url.to_string()))
            }
            Err(e) => Err(FetchError::Transport {
                url: url.to_string(),
                reason: format!("failed to open {}: {}", path.display(), e),
            }),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        if let Some(rest) = url.strip_prefix("file://") {
            return Self::open_file(url, rest);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(FetchError::UnsupportedUrl(url.to_string()));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Box::new(resp))
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// One progress report for a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    /// Percent of the expected length received, non-decreasing.
    Percent(u8),
    /// The expected length is zero; only a byte count is known.
    Indeterminate { bytes: u64 },
}

/// Receives download progress. Called on the downloading thread.
pub trait Progress {
    fn update(&mut self, progress: DownloadProgress);

    fn close(&mut self) {}
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _progress: DownloadProgress) {}
}

/// Asks the user whether to proceed.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Approves every prompt (non-interactive use).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        true
    }
}

/// Forwards progress over a bounded channel without ever blocking.
///
/// Updates are dropped while the channel is full. [`Progress::close`]
/// disconnects the channel, which ends the receiver's iteration.
pub struct ChannelProgress {
    tx: Option<SyncSender<DownloadProgress>>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, Receiver<DownloadProgress>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

impl Progress for ChannelProgress {
    fn update(&mut self, progress: DownloadProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(progress);
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Shared flag checked at every chunk boundary of a download.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Verified Streaming
// =============================================================================

/// Removes the `.part` file unless the download completed.
struct PartialFile {
    path: PathBuf,
    done: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// What a streamed download must match.
pub(crate) struct Expected<'a> {
    pub target: &'a str,
    pub length: u64,
    pub sha256: &'a str,
}

/// Stream `url` into `part`, checking length and SHA-256 as bytes arrive,
/// then rename it to `dest`. On any failure `part` is removed.
pub(crate) fn download_verified(
    fetcher: &dyn Fetcher,
    url: &str,
    expected: &Expected<'_>,
    part: &Path,
    dest: &Path,
    progress: &mut dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let result = stream(fetcher, url, expected, part, dest, progress, cancel);
    progress.close();
    result
}

fn stream(
    fetcher: &dyn Fetcher,
    url: &str,
    expected: &Expected<'_>,
    part: &Path,
    dest: &Path,
    progress: &mut dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TufError::Cancelled);
    }
    let mut source = fetcher.open(url)?;

    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let mut guard = PartialFile {
        path: part.to_path_buf(),
        done: false,
    };
    let mut file = File::create(part).at(part)?;

    let integrity = |reason: String| TufError::Integrity {
        target: expected.target.to_string(),
        reason,
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; fetcher.chunk_size().max(1)];
    let mut received = 0u64;
    let mut last_percent = 0u8;
    if expected.length > 0 {
        progress.update(DownloadProgress::Percent(0));
    }

    loop {
        if cancel.is_cancelled() {
            tracing::info!(target = expected.target, received, "download cancelled");
            return Err(TufError::Cancelled);
        }
        let n = source.read(&mut buf).map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        received += n as u64;
        if received > expected.length {
            return Err(integrity(format!(
                "received more than the expected {} bytes",
                expected.length
            )));
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).at(part)?;

        if expected.length == 0 {
            progress.update(DownloadProgress::Indeterminate { bytes: received });
        } else {
            let percent = (received * 100 / expected.length) as u8;
            if percent > last_percent {
                last_percent = percent;
                progress.update(DownloadProgress::Percent(percent));
            }
        }
    }

    file.sync_all().at(part)?;
    drop(file);

    if received != expected.length {
        return Err(integrity(format!(
            "expected {} bytes, received {}",
            expected.length, received
        )));
    }
    let actual = hex::encode(hasher.finalize());
    if actual != expected.sha256 {
        return Err(integrity(format!(
            "expected sha256 {}, got {}",
            expected.sha256, actual
        )));
    }

    fs::rename(part, dest).at(dest)?;
    guard.done = true;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
