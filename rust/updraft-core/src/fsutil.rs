//! Crash-safe file writes and hashing helpers.
//!
//! Every metadata or key file is written to a sibling temp file, fsynced,
//! then renamed over the destination. Readers therefore see either the old
//! or the new file, never a torn one.

use crate::error::{IoContext, Result, TufError};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Stream `path` through SHA-256. Returns `(length, hex digest)`.
pub fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut length = 0u64;
    loop {
        let n = file.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok((length, hex::encode(hasher.finalize())))
}

pub fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).at(path)
}

pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes, None)?;
    rename(&tmp, path)
}

/// Like [`write_atomic`], but the file is only readable by its owner.
pub fn write_private_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes, Some(0o600))?;
    rename(&tmp, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn write_temp(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    set_mode(&mut opts, mode);

    let result = opts.open(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TufError::io(&tmp, e));
    }
    Ok(tmp)
}

fn rename(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(TufError::io(path, e));
    }
    sync_parent(path);
    Ok(())
}

#[cfg(unix)]
fn set_mode(opts: &mut OpenOptions, mode: Option<u32>) {
    if let Some(mode) = mode {
        opts.mode(mode);
    }
}

#[cfg(not(unix))]
fn set_mode(_opts: &mut OpenOptions, _mode: Option<u32>) {}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

// =============================================================================
// Staged Writes
// =============================================================================

/// A group of files written to temp files first and renamed into place
/// together by [`StagedWrites::commit`].
///
/// Renames happen in staging order. Anything not committed is removed on
/// drop, so a failed check part-way through leaves the destination alone.
#[derive(Debug, Default)]
pub struct StagedWrites {
    pending: Vec<(PathBuf, PathBuf)>,
}

impl StagedWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = write_temp(path, bytes, None)?;
        self.pending.push((tmp, path.to_path_buf()));
        Ok(())
    }

    pub fn stage_private(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = write_temp(path, bytes, Some(0o600))?;
        self.pending.push((tmp, path.to_path_buf()));
        Ok(())
    }

    /// Copy `src` to a temp file beside `dest`. Returns the temp path so
    /// the staged bytes can be inspected before commit.
    pub fn stage_copy(&mut self, src: &Path, dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        let tmp = temp_path(dest);
        let result = fs::copy(src, &tmp).and_then(|_| File::open(&tmp)?.sync_all());
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(TufError::io(src, e));
        }
        self.pending.push((tmp.clone(), dest.to_path_buf()));
        Ok(tmp)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn commit(mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut iter = pending.into_iter();
        while let Some((tmp, path)) = iter.next() {
            if let Err(e) = rename(&tmp, &path) {
                for (rest, _) in iter {
                    let _ = fs::remove_file(rest);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for StagedWrites {
    fn drop(&mut self) {
        for (tmp, _) in self.pending.drain(..) {
            let _ = fs::remove_file(tmp);
        }
    }
}
