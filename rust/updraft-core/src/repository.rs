//! Repository authoring: initialise, publish, and rotate root keys.
//!
//! All state lives in an explicit [`RepositoryState`]. Loading or creating
//! one takes the repository lock, which is released when the state is
//! dropped, so two authoring invocations never interleave.

use crate::error::{IoContext, Result, TufError};
use crate::fsutil::{self, StagedWrites};
use crate::keys::{self, KdfParams, KeyPair};
use crate::metadata::{
    expires_in, is_valid_target_path, MetaFile, Metadata, Role, RoleType, Root, Snapshot,
    TargetFile, Targets, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub const DEFAULT_EXPIRY_DAYS: i64 = 7;
pub const DEFAULT_ROOT_EXPIRY_DAYS: i64 = 365;

const METADATA_DIR: &str = "metadata";
const TIMESTAMP_FILE: &str = "timestamp.json";
const LOCK_FILE: &str = ".lock";

/// Where a repository lives and how its metadata is produced.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub repo_dir: PathBuf,
    pub keys_dir: PathBuf,
    /// Lifetime of targets, snapshot, and timestamp metadata.
    pub expiry_days: i64,
    pub root_expiry_days: i64,
    pub kdf: KdfParams,
}

impl RepositoryConfig {
    pub fn new(repo_dir: impl Into<PathBuf>, keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            keys_dir: keys_dir.into(),
            expiry_days: DEFAULT_EXPIRY_DAYS,
            root_expiry_days: DEFAULT_ROOT_EXPIRY_DAYS,
            kdf: KdfParams::default(),
        }
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.repo_dir.join(METADATA_DIR)
    }

    fn metadata_path(&self, filename: &str) -> PathBuf {
        self.metadata_dir().join(filename)
    }
}

/// A file to publish under `target_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub target_path: String,
    pub source: PathBuf,
}

impl Artifact {
    pub fn new(target_path: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            source: source.into(),
        }
    }
}

impl std::str::FromStr for Artifact {
    type Err = String;

    /// `TARGET_PATH=FILE`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((path, file)) if !path.is_empty() && !file.is_empty() => {
                Ok(Artifact::new(path, file))
            }
            _ => Err(format!("expected TARGET_PATH=FILE, got '{}'", s)),
        }
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Exclusive lock on a repository, held as `{repo_dir}/metadata/.lock`.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    pub fn acquire(metadata_dir: &Path) -> Result<Self> {
        fsutil::create_dir_all(metadata_dir)?;
        let path = metadata_dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(TufError::Locked(path));
            }
            Err(e) => return Err(TufError::io(&path, e)),
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id()).at(&lock.path)?;
        debug!(path = %lock.path.display(), "repository locked");
        Ok(lock)
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release repository lock");
            }
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// The current metadata of a repository plus the keys able to sign it.
pub struct RepositoryState {
    config: RepositoryConfig,
    pub root: Metadata<Root>,
    pub targets: Metadata<Targets>,
    pub snapshot: Metadata<Snapshot>,
    pub timestamp: Metadata<Timestamp>,
    signers: BTreeMap<RoleType, Vec<KeyPair>>,
    passphrase: Zeroizing<String>,
    _lock: RepoLock,
}

impl std::fmt::Debug for RepositoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryState")
            .field("repo_dir", &self.config.repo_dir)
            .field("root", &self.root.version())
            .field("targets", &self.targets.version())
            .field("snapshot", &self.snapshot.version())
            .field("timestamp", &self.timestamp.version())
            .finish_non_exhaustive()
    }
}

/// Highest `n` among `{n}.root.json` files in `metadata_dir`.
fn latest_root_version(metadata_dir: &Path) -> Result<Option<u64>> {
    let mut latest = None;
    for entry in std::fs::read_dir(metadata_dir).at(metadata_dir)? {
        let entry = entry.at(metadata_dir)?;
        let name = entry.file_name();
        let version = name
            .to_str()
            .and_then(|n| n.strip_suffix(".root.json"))
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(v) = version {
            latest = latest.max(Some(v));
        }
    }
    Ok(latest)
}

impl RepositoryState {
    /// Load the latest metadata from `{repo_dir}/metadata` and decrypt the
    /// signing keys from `keys_dir`.
    pub fn load(config: RepositoryConfig, passphrase: &str) -> Result<Self> {
        let metadata_dir = config.metadata_dir();
        if !metadata_dir.is_dir() {
            return Err(TufError::io(
                &metadata_dir,
                std::io::Error::new(ErrorKind::NotFound, "repository is not initialised"),
            ));
        }
        let lock = RepoLock::acquire(&metadata_dir)?;

        let root_version = latest_root_version(&metadata_dir)?.ok_or_else(|| {
            TufError::io(
                &metadata_dir,
                std::io::Error::new(ErrorKind::NotFound, "no root metadata found"),
            )
        })?;
        let root_path = config.metadata_path(&format!("{}.root.json", root_version));
        let root = Metadata::<Root>::from_file(&root_path)?;
        let timestamp = Metadata::<Timestamp>::from_file(&config.metadata_path(TIMESTAMP_FILE))?;
        let snapshot_version = timestamp.signed.snapshot_meta()?.version;
        let snapshot = Metadata::<Snapshot>::from_file(
            &config.metadata_path(&format!("{}.snapshot.json", snapshot_version)),
        )?;
        let targets_version = snapshot
            .signed
            .targets_meta()
            .map(|m| m.version)
            .ok_or_else(|| TufError::MalformedMetadata("snapshot does not pin targets".into()))?;
        let targets = Metadata::<Targets>::from_file(
            &config.metadata_path(&format!("{}.targets.json", targets_version)),
        )?;

        let mut signers = BTreeMap::new();
        for role in RoleType::ALL {
            let pem_text = keys::read_key_file(&config.keys_dir, role)?;
            let key = keys::import_private(&pem_text, passphrase)?;
            let authorized = root
                .signed
                .role_keys(role)
                .is_some_and(|k| k.keyids.iter().any(|id| id == key.key_id()));
            if !authorized {
                warn!(
                    role = %role,
                    key_id = key.key_id(),
                    "key file is not authorized by the current root"
                );
            }
            signers.insert(role, vec![key]);
        }

        info!(
            root = root.version(),
            targets = targets.version(),
            snapshot = snapshot.version(),
            timestamp = timestamp.version(),
            "loaded repository"
        );
        Ok(Self {
            config,
            root,
            targets,
            snapshot,
            timestamp,
            signers,
            passphrase: Zeroizing::new(passphrase.to_string()),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Key ids of the loaded signing keys for `role`.
    pub fn signer_ids(&self, role: RoleType) -> Vec<String> {
        self.signers
            .get(&role)
            .map(|keys| keys.iter().map(|k| k.key_id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Drop `target_path` from the targets metadata. Takes effect at the
    /// next [`publish_update`].
    pub fn remove_target(&mut self, target_path: &str) -> Result<()> {
        if self.targets.signed.targets.remove(target_path).is_none() {
            return Err(TufError::TargetNotFound(target_path.to_string()));
        }
        info!(target = target_path, "target removed");
        Ok(())
    }

    /// Re-sign `doc` with every loaded key authorized for its role, then
    /// confirm the result meets the threshold in the current root.
    fn sign_role<T: Role>(&self, doc: &mut Metadata<T>) -> Result<()> {
        doc.clear_signatures();
        let authorized = self
            .root
            .signed
            .role_keys(T::TYPE)
            .map(|k| k.keyids.clone())
            .unwrap_or_default();
        for key in self.signers.get(&T::TYPE).into_iter().flatten() {
            if authorized.iter().any(|id| id == key.key_id()) {
                doc.sign(key)?;
            }
        }
        keys::verify_threshold(doc, T::TYPE, &self.root.signed)?;
        Ok(())
    }
}

fn check_artifact_path(target_path: &str) -> Result<()> {
    if !is_valid_target_path(target_path) || target_path.split('/').next() == Some(METADATA_DIR) {
        return Err(TufError::MalformedMetadata(format!(
            "invalid target path '{}'",
            target_path
        )));
    }
    Ok(())
}

fn check_artifacts(artifacts: &[Artifact]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for artifact in artifacts {
        check_artifact_path(&artifact.target_path)?;
        if !seen.insert(artifact.target_path.as_str()) {
            return Err(TufError::MalformedMetadata(format!(
                "target path '{}' given twice",
                artifact.target_path
            )));
        }
    }
    Ok(())
}

/// Stage a copy of an artifact for `{repo_dir}/{target_path}` and describe
/// the staged bytes. Nothing is visible until `staged` commits.
fn stage_artifact(
    repo_dir: &Path,
    artifact: &Artifact,
    staged: &mut StagedWrites,
) -> Result<TargetFile> {
    let dest = repo_dir.join(&artifact.target_path);
    let tmp = staged.stage_copy(&artifact.source, &dest)?;
    let file = TargetFile::from_file(&tmp)?;
    debug!(target = %artifact.target_path, length = file.length, "staged artifact");
    Ok(file)
}

// =============================================================================
// Operations
// =============================================================================

/// Create a repository: one fresh key per role, version 1 of every role,
/// and the initial `artifacts`.
///
/// Refuses to touch a directory that already holds metadata or keys.
pub fn init_repository(
    config: RepositoryConfig,
    artifacts: &[Artifact],
    passphrase: &str,
) -> Result<RepositoryState> {
    let metadata_dir = config.metadata_dir();
    let existing = [
        config.metadata_path("1.root.json"),
        config.metadata_path(TIMESTAMP_FILE),
        keys::key_file_path(&config.keys_dir, RoleType::Root),
    ];
    if let Some(path) = existing.iter().find(|p| p.exists()) {
        return Err(TufError::io(
            path,
            std::io::Error::new(ErrorKind::AlreadyExists, "repository already initialised"),
        ));
    }
    check_artifacts(artifacts)?;
    let lock = RepoLock::acquire(&metadata_dir)?;

    let mut signers = BTreeMap::new();
    let mut root = Root::new(expires_in(config.root_expiry_days));
    for role in RoleType::ALL {
        let key = KeyPair::generate();
        root.add_key(role, key.public_key())?;
        signers.insert(role, vec![key]);
    }

    // Artifacts are staged first so they land before the metadata naming them.
    let mut staged = StagedWrites::new();
    let mut targets = Targets::new(expires_in(config.expiry_days));
    for artifact in artifacts {
        let file = stage_artifact(&config.repo_dir, artifact, &mut staged)?;
        targets.targets.insert(artifact.target_path.clone(), file);
    }

    let mut state = RepositoryState {
        root: Metadata::new(root),
        targets: Metadata::new(targets),
        snapshot: Metadata::new(Snapshot::new(expires_in(config.expiry_days))),
        timestamp: Metadata::new(Timestamp::new(expires_in(config.expiry_days))),
        config,
        signers,
        passphrase: Zeroizing::new(passphrase.to_string()),
        _lock: lock,
    };

    let mut root = state.root.clone();
    state.sign_role(&mut root)?;
    state.root = root;

    for role in RoleType::ALL {
        for key in state.signers.get(&role).into_iter().flatten() {
            let pem_text = keys::export_private_with(key, &state.passphrase, &state.config.kdf)?;
            let path = keys::key_file_path(&state.config.keys_dir, role);
            staged.stage_private(&path, pem_text.as_bytes())?;
        }
    }
    staged.stage(
        &state.config.metadata_path(&state.root.versioned_filename()),
        &state.root.to_pretty_vec()?,
    )?;
    sign_and_stage_cycle(&mut state, &mut staged)?;
    staged.commit()?;

    info!(
        repo = %state.config.repo_dir.display(),
        targets = state.targets.signed.targets.len(),
        "initialised repository"
    );
    Ok(state)
}

/// Sign targets, snapshot, and timestamp in that order, each pinning the
/// serialized bytes of the previous one, and stage their files.
fn sign_and_stage_cycle(state: &mut RepositoryState, staged: &mut StagedWrites) -> Result<()> {
    let mut targets = state.targets.clone();
    state.sign_role(&mut targets)?;
    let targets_bytes = targets.to_pretty_vec()?;

    let mut snapshot = state.snapshot.clone();
    snapshot.signed.meta.insert(
        crate::metadata::TARGETS_META.to_string(),
        MetaFile::describing(targets.version(), &targets_bytes),
    );
    state.sign_role(&mut snapshot)?;
    let snapshot_bytes = snapshot.to_pretty_vec()?;

    let mut timestamp = state.timestamp.clone();
    timestamp
        .signed
        .set_snapshot_meta(MetaFile::describing(snapshot.version(), &snapshot_bytes));
    state.sign_role(&mut timestamp)?;
    let timestamp_bytes = timestamp.to_pretty_vec()?;

    // Timestamp last: it must never point at an unwritten snapshot.
    let config = &state.config;
    staged.stage(&config.metadata_path(&targets.versioned_filename()), &targets_bytes)?;
    staged.stage(&config.metadata_path(&snapshot.versioned_filename()), &snapshot_bytes)?;
    staged.stage(&config.metadata_path(TIMESTAMP_FILE), &timestamp_bytes)?;

    state.targets = targets;
    state.snapshot = snapshot;
    state.timestamp = timestamp;
    Ok(())
}

/// Publish a new cycle: upsert `artifacts` (plus any pending removals),
/// then bump, extend, and re-sign targets, snapshot, and timestamp.
/// Root is left untouched.
pub fn publish_update(state: &mut RepositoryState, artifacts: &[Artifact]) -> Result<()> {
    check_artifacts(artifacts)?;
    let previous = (
        state.targets.clone(),
        state.snapshot.clone(),
        state.timestamp.clone(),
    );
    if let Err(e) = publish_cycle(state, artifacts) {
        (state.targets, state.snapshot, state.timestamp) = previous;
        return Err(e);
    }

    info!(
        targets = state.targets.version(),
        snapshot = state.snapshot.version(),
        timestamp = state.timestamp.version(),
        "published update"
    );
    Ok(())
}

fn publish_cycle(state: &mut RepositoryState, artifacts: &[Artifact]) -> Result<()> {
    let mut staged = StagedWrites::new();
    for artifact in artifacts {
        let file = stage_artifact(&state.config.repo_dir, artifact, &mut staged)?;
        state
            .targets
            .signed
            .targets
            .insert(artifact.target_path.clone(), file);
    }

    let expiry_days = state.config.expiry_days;
    state.targets.signed.bump_version();
    state.targets.signed.set_expires(expires_in(expiry_days));
    state.snapshot.signed.bump_version();
    state.snapshot.signed.set_expires(expires_in(expiry_days));
    state.timestamp.signed.bump_version();
    state.timestamp.signed.set_expires(expires_in(expiry_days));

    sign_and_stage_cycle(state, &mut staged)?;
    staged.commit()
}

/// Replace root key `old_key_id` with a freshly generated key.
///
/// The new root is signed by every loaded root key the previous root
/// authorizes, plus the new key, and must meet both the previous root's
/// threshold and its own. Returns the new key id.
pub fn rotate_root_key(state: &mut RepositoryState, old_key_id: &str) -> Result<String> {
    let previous = state.root.signed.clone();
    let authorized = previous
        .role_keys(RoleType::Root)
        .map(|k| k.keyids.clone())
        .unwrap_or_default();
    if !authorized.iter().any(|id| id == old_key_id) {
        return Err(TufError::Rotation(format!(
            "{} is not a root key",
            old_key_id
        )));
    }

    let new_key = KeyPair::generate();
    let mut next = previous.clone();
    next.revoke_key(RoleType::Root, old_key_id)?;
    next.add_key(RoleType::Root, new_key.public_key())?;
    next.bump_version();
    next.set_expires(expires_in(state.config.root_expiry_days));

    let mut doc = Metadata::new(next);
    for key in state.signers.get(&RoleType::Root).into_iter().flatten() {
        if authorized.iter().any(|id| id == key.key_id()) {
            doc.sign(key)?;
        }
    }
    doc.sign(&new_key)?;

    keys::verify_threshold(&doc, RoleType::Root, &previous)
        .map_err(|e| TufError::Rotation(format!("previous root threshold: {}", e)))?;
    keys::verify_threshold(&doc, RoleType::Root, &doc.signed)
        .map_err(|e| TufError::Rotation(format!("new root threshold: {}", e)))?;

    // The old key file is kept aside until the new root is in place.
    let pem_text = keys::export_private_with(&new_key, &state.passphrase, &state.config.kdf)?;
    let key_path = keys::key_file_path(&state.config.keys_dir, RoleType::Root);
    let backup_path = key_path.with_extension("pem.old");
    let old_pem = fsutil::read(&key_path)?;
    fsutil::write_private_atomic(&backup_path, &old_pem)?;

    let mut staged = StagedWrites::new();
    staged.stage_private(&key_path, pem_text.as_bytes())?;
    staged.stage(
        &state.config.metadata_path(&doc.versioned_filename()),
        &doc.to_pretty_vec()?,
    )?;
    if let Err(e) = staged.commit() {
        fsutil::write_private_atomic(&key_path, &old_pem)?;
        let _ = std::fs::remove_file(&backup_path);
        return Err(e);
    }
    let _ = std::fs::remove_file(&backup_path);

    let new_key_id = new_key.key_id().to_string();
    let root_signers = state.signers.entry(RoleType::Root).or_default();
    root_signers.retain(|k| k.key_id() != old_key_id);
    root_signers.push(new_key);
    state.root = doc;

    info!(
        version = state.root.version(),
        old_key = old_key_id,
        new_key = %new_key_id,
        "rotated root key"
    );
    Ok(new_key_id)
}
