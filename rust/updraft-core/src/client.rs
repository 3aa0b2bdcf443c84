//! Client-side trust store, metadata refresh, and verified downloads.
//!
//! The refresh is a strict sequence: trusted root, root rotation,
//! timestamp, snapshot, targets. Every step must pass before anything new
//! is written to the local metadata directory.

use crate::error::{FetchError, Result, TufError};
use crate::fetch::{self, CancelToken, Confirm, Expected, Fetcher, Progress};
use crate::fsutil::{self, StagedWrites};
use crate::keys::{authentic, verify_threshold};
use crate::metadata::{Metadata, Role, RoleType, Root, Snapshot, Targets, Timestamp};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MAX_ROOT_SIZE: u64 = 512 * 1024;
pub const MAX_TIMESTAMP_SIZE: u64 = 16 * 1024;
pub const MAX_SNAPSHOT_SIZE: u64 = 2 * 1024 * 1024;
pub const MAX_TARGETS_SIZE: u64 = 2 * 1024 * 1024;
/// Upper bound on root versions walked in one refresh.
pub const MAX_ROOT_ROTATIONS: u64 = 32;

const ROOT_FILE: &str = "root.json";
const TIMESTAMP_FILE: &str = "timestamp.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const TARGETS_FILE: &str = "targets.json";

/// Local directory name for a repository: the first 8 hex chars of the
/// SHA-256 of its base URL.
pub fn client_id(base_url: &str) -> String {
    fsutil::sha256_hex(base_url.trim_end_matches('/').as_bytes())[..8].to_string()
}

/// Trusted facts about one target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub path: String,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
}

impl TargetInfo {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }
}

/// Result of [`Updater::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A verified copy was already in the download directory.
    Cached(PathBuf),
    Downloaded(PathBuf),
    /// The user declined the download.
    Declined,
}

/// Metadata the client currently trusts.
#[derive(Debug, Clone)]
struct TrustedSet {
    root: Metadata<Root>,
    timestamp: Option<Metadata<Timestamp>>,
    snapshot: Option<Metadata<Snapshot>>,
    targets: Option<Metadata<Targets>>,
}

/// Drives trust bootstrap, refresh, and verified downloads for one
/// repository.
///
/// One `Updater` per metadata directory; concurrent updaters on the same
/// directory must be serialized by the caller.
pub struct Updater {
    base_url: String,
    dir: PathBuf,
    download_dir: PathBuf,
    fetcher: Box<dyn Fetcher>,
    trusted: Option<TrustedSet>,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("base_url", &self.base_url)
            .field("dir", &self.dir)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

impl Updater {
    /// Metadata lives under `{client_dir}/{client_id(base_url)}`.
    pub fn new(
        base_url: &str,
        client_dir: &Path,
        download_dir: &Path,
        fetcher: Box<dyn Fetcher>,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let dir = client_dir.join(client_id(&base_url));
        Self {
            base_url,
            dir,
            download_dir: download_dir.to_path_buf(),
            fetcher,
            trusted: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.dir.join(ROOT_FILE).is_file()
    }

    /// The trusted root after a successful [`Updater::refresh`].
    pub fn trusted_root(&self) -> Option<&Metadata<Root>> {
        self.trusted.as_ref().map(|t| &t.root)
    }

    pub fn trusted_targets(&self) -> Option<&Metadata<Targets>> {
        self.trusted.as_ref().and_then(|t| t.targets.as_ref())
    }

    fn metadata_url(&self, filename: &str) -> String {
        format!("{}/metadata/{}", self.base_url, filename)
    }

    fn fetch(&self, filename: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        fetch::fetch_bytes(self.fetcher.as_ref(), &self.metadata_url(filename), max_length)
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Trust-on-first-use: fetch `1.root.json` and store it as the trusted
    /// root without verifying any signature.
    pub fn bootstrap_tofu(&mut self) -> Result<()> {
        let root_path = self.dir.join(ROOT_FILE);
        if root_path.exists() {
            return Err(TufError::Bootstrap(format!(
                "a trusted root already exists at {}",
                root_path.display()
            )));
        }

        let url = self.metadata_url("1.root.json");
        let bytes = self
            .fetch("1.root.json", MAX_ROOT_SIZE)
            .map_err(|e| TufError::Bootstrap(format!("cannot fetch {}: {}", url, e)))?;
        let root = Metadata::<Root>::from_slice(&bytes)
            .map_err(|e| TufError::Bootstrap(format!("{} is not a valid root: {}", url, e)))?;

        let created = !self.dir.exists();
        if let Err(e) = fsutil::write_atomic(&root_path, &bytes) {
            if created {
                let _ = std::fs::remove_dir_all(&self.dir);
            }
            return Err(TufError::Bootstrap(e.to_string()));
        }

        warn!(
            url = %url,
            version = root.version(),
            "trusting root metadata on first use without verification"
        );
        self.trusted = Some(TrustedSet {
            root,
            timestamp: None,
            snapshot: None,
            targets: None,
        });
        Ok(())
    }

    // =========================================================================
    // Local State
    // =========================================================================

    fn load_local(&self) -> Result<TrustedSet> {
        let root_path = self.dir.join(ROOT_FILE);
        if !root_path.is_file() {
            return Err(TufError::NotBootstrapped(self.dir.clone()));
        }
        let root = Metadata::<Root>::from_file(&root_path)?;
        verify_threshold(&root, RoleType::Root, &root.signed)?;

        let timestamp = self.load_optional::<Timestamp>(TIMESTAMP_FILE, &root.signed);
        let mut snapshot = self.load_optional::<Snapshot>(SNAPSHOT_FILE, &root.signed);
        let mut targets = self.load_optional::<Targets>(TARGETS_FILE, &root.signed);

        let snapshot_pin = timestamp
            .as_ref()
            .and_then(|t| t.signed.snapshot_meta().ok())
            .map(|m| m.version);
        if let Some(s) = &snapshot {
            if Some(s.version()) != snapshot_pin {
                warn!(
                    version = s.version(),
                    "local snapshot does not match the local timestamp, discarding"
                );
                snapshot = None;
            }
        }
        let targets_pin = snapshot
            .as_ref()
            .and_then(|s| s.signed.targets_meta())
            .map(|m| m.version);
        if let Some(t) = &targets {
            if Some(t.version()) != targets_pin {
                warn!(
                    version = t.version(),
                    "local targets do not match the local snapshot, discarding"
                );
                targets = None;
            }
        }

        Ok(TrustedSet {
            root,
            timestamp,
            snapshot,
            targets,
        })
    }

    /// Load a previously trusted document. Signatures are checked against
    /// `root`; expiry is not. Anything invalid is discarded.
    fn load_optional<T: Role>(&self, filename: &str, root: &Root) -> Option<Metadata<T>> {
        let path = self.dir.join(filename);
        if !path.is_file() {
            return None;
        }
        let loaded = Metadata::<T>::from_file(&path)
            .and_then(|md| verify_threshold(&md, T::TYPE, root).map(|_| md));
        match loaded {
            Ok(md) => Some(md),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding invalid local metadata");
                None
            }
        }
    }

    fn remove_local(&self, filename: &str) -> Result<()> {
        let path = self.dir.join(filename);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(TufError::io(&path, e)),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Bring local metadata up to date with the repository.
    ///
    /// Fails closed: on any error the previously trusted timestamp,
    /// snapshot, and targets are left untouched.
    pub fn refresh(&mut self) -> Result<()> {
        let mut trusted = self.load_local()?;
        self.update_root(&mut trusted)?;

        let now = Utc::now();
        if trusted.root.signed.is_expired_at(now) {
            return Err(expired(&trusted.root));
        }
        let mut staged = StagedWrites::new();

        // Timestamp
        let bytes = self.fetch(TIMESTAMP_FILE, MAX_TIMESTAMP_SIZE)?;
        let timestamp = Metadata::<Timestamp>::from_slice(&bytes)?;
        verify_threshold(&timestamp, RoleType::Timestamp, &trusted.root.signed)?;
        let snapshot_meta = timestamp.signed.snapshot_meta()?.clone();
        if let Some(old) = &trusted.timestamp {
            check_rollback(RoleType::Timestamp, old.version(), timestamp.version())?;
            check_rollback(
                RoleType::Snapshot,
                old.signed.snapshot_meta()?.version,
                snapshot_meta.version,
            )?;
        }
        if timestamp.signed.is_expired_at(now) {
            return Err(expired(&timestamp));
        }
        debug!(version = timestamp.version(), "timestamp verified");
        staged.stage(&self.dir.join(TIMESTAMP_FILE), &bytes)?;

        // Snapshot
        let snapshot = match trusted.snapshot.take() {
            Some(old)
                if old.version() == snapshot_meta.version
                    && authentic(&old, &trusted.root.signed) =>
            {
                if old.signed.is_expired_at(now) {
                    return Err(expired(&old));
                }
                old
            }
            old => {
                let filename = if trusted.root.signed.consistent_snapshot {
                    format!("{}.{}", snapshot_meta.version, SNAPSHOT_FILE)
                } else {
                    SNAPSHOT_FILE.to_string()
                };
                let bytes = self.fetch(&filename, MAX_SNAPSHOT_SIZE)?;
                snapshot_meta.check_bytes(&bytes).map_err(|reason| {
                    TufError::Consistency(format!(
                    "{} does not match timestamp: {}",
                    filename, reason
                ))
                })?;
                let snapshot = Metadata::<Snapshot>::from_slice(&bytes)?;
                verify_threshold(&snapshot, RoleType::Snapshot, &trusted.root.signed)?;
                if snapshot.version() != snapshot_meta.version {
                    return Err(TufError::Consistency(format!(
                        "timestamp pins snapshot version {}, got {}",
                        snapshot_meta.version,
                        snapshot.version()
                    )));
                }
                if let Some(old) = &old {
                    check_snapshot_meta(&old.signed, &snapshot.signed)?;
                }
                if snapshot.signed.is_expired_at(now) {
                    return Err(expired(&snapshot));
                }
                debug!(version = snapshot.version(), "snapshot verified");
                staged.stage(&self.dir.join(SNAPSHOT_FILE), &bytes)?;
                snapshot
            }
        };

        // Targets
        let targets_meta = snapshot.signed.targets_meta().cloned().ok_or_else(|| {
            TufError::MalformedMetadata("snapshot does not pin targets.json".to_string())
        })?;
        let targets = match trusted.targets.take() {
            Some(old)
                if old.version() == targets_meta.version
                    && authentic(&old, &trusted.root.signed) =>
            {
                if old.signed.is_expired_at(now) {
                    return Err(expired(&old));
                }
                old
            }
            old => {
                let filename = if trusted.root.signed.consistent_snapshot {
                    format!("{}.{}", targets_meta.version, TARGETS_FILE)
                } else {
                    TARGETS_FILE.to_string()
                };
                let bytes = self.fetch(&filename, MAX_TARGETS_SIZE)?;
                targets_meta.check_bytes(&bytes).map_err(|reason| {
                    TufError::Consistency(format!(
                    "{} does not match snapshot: {}",
                    filename, reason
                ))
                })?;
                let targets = Metadata::<Targets>::from_slice(&bytes)?;
                verify_threshold(&targets, RoleType::Targets, &trusted.root.signed)?;
                if targets.version() != targets_meta.version {
                    return Err(TufError::Consistency(format!(
                        "snapshot pins targets version {}, got {}",
                        targets_meta.version,
                        targets.version()
                    )));
                }
                if let Some(old) = &old {
                    check_rollback(RoleType::Targets, old.version(), targets.version())?;
                }
                if targets.signed.is_expired_at(now) {
                    return Err(expired(&targets));
                }
                debug!(version = targets.version(), "targets verified");
                staged.stage(&self.dir.join(TARGETS_FILE), &bytes)?;
                targets
            }
        };

        staged.commit()?;
        info!(
            root = trusted.root.version(),
            timestamp = timestamp.version(),
            snapshot = snapshot.version(),
            targets = targets.version(),
            "metadata refreshed"
        );
        self.trusted = Some(TrustedSet {
            root: trusted.root,
            timestamp: Some(timestamp),
            snapshot: Some(snapshot),
            targets: Some(targets),
        });
        Ok(())
    }

    /// Walk `{n+1}.root.json` until the repository has no newer root.
    fn update_root(&self, trusted: &mut TrustedSet) -> Result<()> {
        for _ in 0..MAX_ROOT_ROTATIONS {
            let next = trusted.root.version() + 1;
            let filename = format!("{}.root.json", next);
            let bytes = match self.fetch(&filename, MAX_ROOT_SIZE) {
                Ok(bytes) => bytes,
                Err(FetchError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let new_root = Metadata::<Root>::from_slice(&bytes)?;
            if new_root.version() != next {
                return Err(TufError::Consistency(format!(
                    "{} contains root version {}",
                    filename,
                    new_root.version()
                )));
            }
            verify_threshold(&new_root, RoleType::Root, &trusted.root.signed)?;
            verify_threshold(&new_root, RoleType::Root, &new_root.signed)?;

            let old = &trusted.root.signed;
            let rotated = |role| old.role_keys(role) != new_root.signed.role_keys(role);
            if rotated(RoleType::Timestamp) || rotated(RoleType::Snapshot) {
                info!("timestamp or snapshot keys rotated, discarding local metadata");
                self.remove_local(TIMESTAMP_FILE)?;
                self.remove_local(SNAPSHOT_FILE)?;
                trusted.timestamp = None;
                trusted.snapshot = None;
            }
            if rotated(RoleType::Targets) {
                info!("targets keys rotated, discarding local targets");
                self.remove_local(TARGETS_FILE)?;
                trusted.targets = None;
            }

            fsutil::write_atomic(&self.dir.join(ROOT_FILE), &bytes)?;
            info!(version = next, "adopted rotated root");
            trusted.root = new_root;
        }
        warn!(
            max = MAX_ROOT_ROTATIONS,
            "stopped after the maximum number of root rotations"
        );
        Ok(())
    }

    // =========================================================================
    // Targets
    // =========================================================================

    /// Look up a target in the trusted targets metadata.
    pub fn get_target_info(&self, target_path: &str) -> Result<TargetInfo> {
        let file = self
            .trusted_targets()
            .and_then(|t| t.signed.targets.get(target_path))
            .ok_or_else(|| TufError::TargetNotFound(target_path.to_string()))?;
        Ok(TargetInfo {
            path: target_path.to_string(),
            length: file.length,
            hashes: file.hashes.clone(),
        })
    }

    /// Deterministic location of a downloaded target.
    pub fn cache_path(&self, info: &TargetInfo) -> PathBuf {
        self.download_dir.join(urlencoding::encode(&info.path).into_owned())
    }

    fn part_path(&self, info: &TargetInfo) -> PathBuf {
        self.download_dir
            .join(format!(".{}.part", urlencoding::encode(&info.path)))
    }

    /// Path of an already-downloaded copy whose length and hash match.
    pub fn find_cached(&self, info: &TargetInfo) -> Option<PathBuf> {
        let path = self.cache_path(info);
        if !path.is_file() {
            return None;
        }
        let expected = info.sha256()?;
        match fsutil::sha256_file(&path) {
            Ok((length, sha256)) if length == info.length && sha256 == expected => {
                debug!(path = %path.display(), "cache hit");
                Some(path)
            }
            Ok(_) => {
                debug!(path = %path.display(), "cached copy does not match, ignoring");
                None
            }
            Err(e) => {
                debug!(error = %e, "cannot hash cached copy");
                None
            }
        }
    }

    /// Download `info` into the cache, verifying length and hash.
    pub fn download_target(
        &self,
        info: &TargetInfo,
        progress: &mut dyn Progress,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let sha256 = info.sha256().ok_or_else(|| TufError::Integrity {
            target: info.path.clone(),
            reason: "no sha256 hash in targets metadata".to_string(),
        })?;
        let encoded: Vec<_> = info.path.split('/').map(urlencoding::encode).collect();
        let url = format!("{}/{}", self.base_url, encoded.join("/"));
        let dest = self.cache_path(info);
        fsutil::create_dir_all(&self.download_dir)?;

        let expected = Expected {
            target: &info.path,
            length: info.length,
            sha256,
        };
        match fetch::download_verified(
            self.fetcher.as_ref(),
            &url,
            &expected,
            &self.part_path(info),
            &dest,
            progress,
            cancel,
        ) {
            Ok(()) => {
                info!(target = %info.path, path = %dest.display(), "download verified");
                Ok(dest)
            }
            Err(e) => {
                if e.is_security_failure() {
                    warn!(target = %info.path, error = %e, "download rejected");
                }
                Err(e)
            }
        }
    }

    /// Refresh, resolve `target_path`, and download it unless a verified
    /// copy is already cached. `confirm` is asked only before a download.
    pub fn update(
        &mut self,
        target_path: &str,
        confirm: &mut dyn Confirm,
        progress: &mut dyn Progress,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome> {
        self.refresh()?;
        let info = self.get_target_info(target_path)?;
        if let Some(path) = self.find_cached(&info) {
            return Ok(UpdateOutcome::Cached(path));
        }
        let prompt = format!(
            "Download {} ({} bytes) from {}?",
            info.path, info.length, self.base_url
        );
        if !confirm.confirm(&prompt) {
            return Ok(UpdateOutcome::Declined);
        }
        self.download_target(&info, progress, cancel)
            .map(UpdateOutcome::Downloaded)
    }
}

fn expired<T: Role>(md: &Metadata<T>) -> TufError {
    TufError::MetadataExpired {
        role: T::TYPE,
        expires: md.expires().to_rfc3339(),
    }
}

fn check_rollback(role: RoleType, current: u64, received: u64) -> Result<()> {
    if received < current {
        return Err(TufError::RollbackDetected {
            role,
            current,
            received,
        });
    }
    Ok(())
}

/// Every file pinned by the old snapshot must still be pinned, at the same
/// or a newer version.
fn check_snapshot_meta(old: &Snapshot, new: &Snapshot) -> Result<()> {
    for (name, old_meta) in &old.meta {
        let new_meta = new.meta.get(name).ok_or_else(|| {
            TufError::Consistency(format!("new snapshot no longer lists '{}'", name))
        })?;
        if new_meta.version < old_meta.version {
            return Err(TufError::RollbackDetected {
                role: RoleType::Targets,
                current: old_meta.version,
                received: new_meta.version,
            });
        }
    }
    Ok(())
}
