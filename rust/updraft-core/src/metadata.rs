//! TUF-style metadata model.
//!
//! Four signed documents protect a repository of update artifacts:
//!
//! - **Root**: public keys for all roles and their signature thresholds
//! - **Targets**: target path to expected length and hashes
//! - **Snapshot**: the exact version of every targets file
//! - **Timestamp**: the exact version (and hash) of the current snapshot
//!
//! Every document travels in a [`Metadata`] envelope: `{signed, signatures}`.
//! Signatures cover [`canonical_json`] of the `signed` payload only.

use crate::de::unique_map;
use crate::error::{Result, TufError};
use crate::fsutil;
use crate::keys::{self, KeyPair, PublicKey, Signature};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata format version written by this crate.
pub const SPEC_VERSION: &str = "1.0.31";

/// Snapshot `meta` key for the top-level targets file.
pub const TARGETS_META: &str = "targets.json";

/// Timestamp `meta` key for the snapshot file.
pub const SNAPSHOT_META: &str = "snapshot.json";

// =============================================================================
// Roles
// =============================================================================

/// Identifies which role a metadata document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    /// Root role: defines keys and thresholds for all roles.
    Root,
    /// Targets role: maps target paths to hashes and sizes.
    Targets,
    /// Snapshot role: pins the version of every targets file.
    Snapshot,
    /// Timestamp role: pins the current snapshot; short-lived.
    Timestamp,
}

impl RoleType {
    /// All top-level roles, in signing order for a fresh repository.
    pub const ALL: [RoleType; 4] = [
        RoleType::Root,
        RoleType::Targets,
        RoleType::Snapshot,
        RoleType::Timestamp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Targets => "targets",
            RoleType::Snapshot => "snapshot",
            RoleType::Timestamp => "timestamp",
        }
    }
}

impl std::fmt::Display for RoleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "root" => Ok(RoleType::Root),
            "targets" => Ok(RoleType::Targets),
            "snapshot" => Ok(RoleType::Snapshot),
            "timestamp" => Ok(RoleType::Timestamp),
            other => Err(format!("unknown role: '{}'", other)),
        }
    }
}

/// An expiry `days` from now, truncated to whole seconds.
pub fn expires_in(days: i64) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0) + Duration::days(days)
}

// =============================================================================
// Role Trait
// =============================================================================

/// Common behaviour of the four signed payloads.
pub trait Role: Serialize + DeserializeOwned + Clone {
    /// The role this payload type represents.
    const TYPE: RoleType;

    fn kind(&self) -> RoleType;
    fn spec_version(&self) -> &str;
    /// Positive, strictly increasing across published updates.
    fn version(&self) -> u64;
    fn expires(&self) -> DateTime<Utc>;
    fn bump_version(&mut self);
    fn set_expires(&mut self, expires: DateTime<Utc>);

    /// Structural validation of the payload.
    fn validate(&self) -> Result<()>;

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires() <= now
    }
}

fn check_common<T: Role>(signed: &T) -> Result<()> {
    if signed.kind() != T::TYPE {
        return Err(TufError::MalformedMetadata(format!(
            "expected _type '{}', found '{}'",
            T::TYPE,
            signed.kind()
        )));
    }
    if signed.version() == 0 {
        return Err(TufError::MalformedMetadata(format!(
            "{} version must be a positive integer",
            T::TYPE
        )));
    }
    if !signed.spec_version().starts_with("1.") {
        return Err(TufError::MalformedMetadata(format!(
            "unsupported spec_version '{}'",
            signed.spec_version()
        )));
    }
    Ok(())
}

macro_rules! impl_role {
    ($ty:ty, $role:expr) => {
        impl Role for $ty {
            const TYPE: RoleType = $role;

            fn kind(&self) -> RoleType {
                self.kind
            }
            fn spec_version(&self) -> &str {
                &self.spec_version
            }
            fn version(&self) -> u64 {
                self.version
            }
            fn expires(&self) -> DateTime<Utc> {
                self.expires
            }
            fn bump_version(&mut self) {
                self.version += 1;
            }
            fn set_expires(&mut self, expires: DateTime<Utc>) {
                self.expires = expires;
            }
            fn validate(&self) -> Result<()> {
                check_common(self)?;
                self.validate_body()
            }
        }
    };
}

// =============================================================================
// Root
// =============================================================================

/// Key ids authorized for a role and how many of them must sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

/// Root metadata: the trust anchor for the whole repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    #[serde(rename = "_type")]
    pub kind: RoleType,
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(deserialize_with = "unique_map")]
    pub keys: BTreeMap<String, PublicKey>,
    #[serde(deserialize_with = "unique_map")]
    pub roles: BTreeMap<String, RoleKeys>,
    pub consistent_snapshot: bool,
}

impl_role!(Root, RoleType::Root);

impl Root {
    /// Version 1 root with every role defined, no keys, and threshold 1.
    pub fn new(expires: DateTime<Utc>) -> Self {
        let roles = RoleType::ALL
            .iter()
            .map(|role| {
                (
                    role.to_string(),
                    RoleKeys {
                        keyids: Vec::new(),
                        threshold: 1,
                    },
                )
            })
            .collect();
        Self {
            kind: RoleType::Root,
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            expires,
            keys: BTreeMap::new(),
            roles,
            consistent_snapshot: true,
        }
    }

    pub fn role_keys(&self, role: RoleType) -> Option<&RoleKeys> {
        self.roles.get(role.as_str())
    }

    pub fn key(&self, key_id: &str) -> Option<&PublicKey> {
        self.keys.get(key_id)
    }

    /// Authorize `key` for `role`. Returns the key id.
    pub fn add_key(&mut self, role: RoleType, key: PublicKey) -> Result<String> {
        let key_id = key.key_id();
        let entry = self.roles.entry(role.to_string()).or_insert(RoleKeys {
            keyids: Vec::new(),
            threshold: 1,
        });
        if !entry.keyids.contains(&key_id) {
            entry.keyids.push(key_id.clone());
        }
        self.keys.insert(key_id.clone(), key);
        Ok(key_id)
    }

    /// Remove `key_id` from `role`. The key itself is dropped from `keys`
    /// once no role references it.
    pub fn revoke_key(&mut self, role: RoleType, key_id: &str) -> Result<()> {
        let entry = self.roles.get_mut(role.as_str()).ok_or_else(|| {
            TufError::MalformedMetadata(format!("role '{}' is not defined", role))
        })?;
        let before = entry.keyids.len();
        entry.keyids.retain(|id| id != key_id);
        if entry.keyids.len() == before {
            return Err(TufError::MalformedMetadata(format!(
                "key {} is not authorized for role '{}'",
                key_id, role
            )));
        }
        let still_used = self
            .roles
            .values()
            .any(|keys| keys.keyids.iter().any(|id| id == key_id));
        if !still_used {
            self.keys.remove(key_id);
        }
        Ok(())
    }

    pub fn set_threshold(&mut self, role: RoleType, threshold: u32) -> Result<()> {
        if threshold == 0 {
            return Err(TufError::MalformedMetadata(format!(
                "threshold for '{}' must be at least 1",
                role
            )));
        }
        let entry = self.roles.get_mut(role.as_str()).ok_or_else(|| {
            TufError::MalformedMetadata(format!("role '{}' is not defined", role))
        })?;
        entry.threshold = threshold;
        Ok(())
    }

    fn validate_body(&self) -> Result<()> {
        for (key_id, key) in &self.keys {
            if key.key_id() != *key_id {
                return Err(TufError::MalformedMetadata(format!(
                    "key id {} does not match its key",
                    key_id
                )));
            }
        }
        for role in RoleType::ALL {
            let keys = self.role_keys(role).ok_or_else(|| {
                TufError::MalformedMetadata(format!("root does not define role '{}'", role))
            })?;
            if keys.threshold == 0 {
                return Err(TufError::MalformedMetadata(format!(
                    "threshold for '{}' must be at least 1",
                    role
                )));
            }
            if let Some(missing) = keys.keyids.iter().find(|id| !self.keys.contains_key(*id)) {
                return Err(TufError::MalformedMetadata(format!(
                    "role '{}' references unknown key {}",
                    role, missing
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Targets
// =============================================================================

/// Expected length and hashes of one target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub length: u64,
    #[serde(deserialize_with = "unique_map")]
    pub hashes: BTreeMap<String, String>,
}

impl TargetFile {
    pub fn new(length: u64, sha256: String) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256);
        Self { length, hashes }
    }

    /// Describe the file at `path` by streaming it through SHA-256.
    pub fn from_file(path: &Path) -> Result<Self> {
        let (length, sha256) = fsutil::sha256_file(path)?;
        Ok(Self::new(length, sha256))
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }

    pub fn matches(&self, length: u64, sha256: &str) -> bool {
        self.length == length && self.sha256() == Some(sha256)
    }
}

/// Relative, `/`-separated, with no empty, `.` or `..` components.
pub fn is_valid_target_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Targets metadata: maps target paths to their expected length and hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(rename = "_type")]
    pub kind: RoleType,
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(deserialize_with = "unique_map")]
    pub targets: BTreeMap<String, TargetFile>,
}

impl_role!(Targets, RoleType::Targets);

impl Targets {
    pub fn new(expires: DateTime<Utc>) -> Self {
        Self {
            kind: RoleType::Targets,
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            expires,
            targets: BTreeMap::new(),
        }
    }

    fn validate_body(&self) -> Result<()> {
        for (path, file) in &self.targets {
            if !is_valid_target_path(path) {
                return Err(TufError::MalformedMetadata(format!(
                    "invalid target path '{}'",
                    path
                )));
            }
            match file.sha256() {
                Some(hash) if hash.len() == 64 && hex::decode(hash).is_ok() => {}
                _ => {
                    return Err(TufError::MalformedMetadata(format!(
                        "target '{}' has no valid sha256 hash",
                        path
                    )))
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Snapshot / Timestamp
// =============================================================================

/// Version pin (plus optional length and hashes) for a metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BTreeMap<String, String>>,
}

impl MetaFile {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            length: None,
            hashes: None,
        }
    }

    /// Pin `version` together with the length and sha256 of `bytes`.
    pub fn describing(version: u64, bytes: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), fsutil::sha256_hex(bytes));
        Self {
            version,
            length: Some(bytes.len() as u64),
            hashes: Some(hashes),
        }
    }

    /// Check served bytes against the pinned length and hashes, if any.
    pub fn check_bytes(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if let Some(length) = self.length {
            if length != bytes.len() as u64 {
                return Err(format!("expected {} bytes, got {}", length, bytes.len()));
            }
        }
        if let Some(expected) = self.hashes.as_ref().and_then(|h| h.get("sha256")) {
            let actual = fsutil::sha256_hex(bytes);
            if *expected != actual {
                return Err(format!("expected sha256 {}, got {}", expected, actual));
            }
        }
        Ok(())
    }
}

fn check_meta_versions(role: RoleType, meta: &BTreeMap<String, MetaFile>) -> Result<()> {
    if let Some((name, _)) = meta.iter().find(|(_, m)| m.version == 0) {
        return Err(TufError::MalformedMetadata(format!(
            "{} pins '{}' at version 0",
            role, name
        )));
    }
    Ok(())
}

/// Snapshot metadata: pins the exact version of every targets file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_type")]
    pub kind: RoleType,
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(deserialize_with = "unique_map")]
    pub meta: BTreeMap<String, MetaFile>,
}

impl_role!(Snapshot, RoleType::Snapshot);

impl Snapshot {
    /// Version 1 snapshot pinning targets version 1.
    pub fn new(expires: DateTime<Utc>) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(TARGETS_META.to_string(), MetaFile::new(1));
        Self {
            kind: RoleType::Snapshot,
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            expires,
            meta,
        }
    }

    pub fn targets_meta(&self) -> Option<&MetaFile> {
        self.meta.get(TARGETS_META)
    }

    fn validate_body(&self) -> Result<()> {
        if self.targets_meta().is_none() {
            return Err(TufError::MalformedMetadata(format!(
                "snapshot does not pin '{}'",
                TARGETS_META
            )));
        }
        check_meta_versions(RoleType::Snapshot, &self.meta)
    }
}

/// Timestamp metadata: pins the current snapshot. The entry point of every
/// refresh, and the shortest-lived document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "_type")]
    pub kind: RoleType,
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(deserialize_with = "unique_map")]
    pub meta: BTreeMap<String, MetaFile>,
}

impl_role!(Timestamp, RoleType::Timestamp);

impl Timestamp {
    /// Version 1 timestamp pinning snapshot version 1.
    pub fn new(expires: DateTime<Utc>) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(SNAPSHOT_META.to_string(), MetaFile::new(1));
        Self {
            kind: RoleType::Timestamp,
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            expires,
            meta,
        }
    }

    /// The single snapshot pin. Validation guarantees it exists.
    pub fn snapshot_meta(&self) -> Result<&MetaFile> {
        self.meta.get(SNAPSHOT_META).ok_or_else(|| {
            TufError::MalformedMetadata(format!("timestamp does not pin '{}'", SNAPSHOT_META))
        })
    }

    pub fn set_snapshot_meta(&mut self, meta: MetaFile) {
        self.meta.clear();
        self.meta.insert(SNAPSHOT_META.to_string(), meta);
    }

    fn validate_body(&self) -> Result<()> {
        if self.meta.len() != 1 || !self.meta.contains_key(SNAPSHOT_META) {
            return Err(TufError::MalformedMetadata(format!(
                "timestamp must pin exactly '{}'",
                SNAPSHOT_META
            )));
        }
        check_meta_versions(RoleType::Timestamp, &self.meta)
    }
}

// =============================================================================
// Signed Envelope
// =============================================================================

/// A signed metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata<T> {
    pub signed: T,
    pub signatures: Vec<Signature>,
}

/// Compact JSON with lexicographically ordered object keys.
///
/// Going through `serde_json::Value` sorts every object, since its map is a
/// `BTreeMap` unless `preserve_order` is enabled (it is not).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| TufError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| TufError::Serialization(e.to_string()))
}

impl<T: Role> Metadata<T> {
    /// Wrap an unsigned payload.
    pub fn new(signed: T) -> Self {
        Self {
            signed,
            signatures: Vec::new(),
        }
    }

    pub fn role(&self) -> RoleType {
        T::TYPE
    }

    pub fn version(&self) -> u64 {
        self.signed.version()
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.signed.expires()
    }

    /// The bytes signatures are computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(&self.signed)
    }

    /// Append a signature by `key`, replacing an older one from the same key.
    pub fn sign(&mut self, key: &KeyPair) -> Result<()> {
        let data = self.canonical_bytes()?;
        let signature = keys::sign(&data, key);
        self.signatures.retain(|s| s.keyid != signature.keyid);
        self.signatures.push(signature);
        Ok(())
    }

    pub fn clear_signatures(&mut self) {
        self.signatures.clear();
    }

    /// Parse and structurally validate a document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let metadata: Self = serde_json::from_slice(bytes)
            .map_err(|e| TufError::MalformedMetadata(format!("{} metadata: {}", T::TYPE, e)))?;
        metadata.signed.validate()?;
        Ok(metadata)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fsutil::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Human-readable serialization used for files on disk.
    pub fn to_pretty_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| TufError::Serialization(e.to_string()))
    }

    /// `{version}.{role}.json`, the consistent-snapshot filename.
    pub fn versioned_filename(&self) -> String {
        format!("{}.{}.json", self.version(), T::TYPE)
    }
}

// =============================================================================
// Tests
// =============================================================================
