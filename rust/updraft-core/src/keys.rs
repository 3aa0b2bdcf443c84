//! Ed25519 keys, signatures, threshold verification, and encrypted key files.
//!
//! Private keys at rest are a PEM block tagged `UPDRAFT ENCRYPTED PRIVATE KEY`
//! whose contents are:
//!
//! ```text
//! version (1) | m_cost (4, BE) | t_cost (4, BE) | p_cost (4, BE) | salt (16) | nonce (12)
//! | ciphertext+tag
//! ```
//!
//! The AES-256-GCM key is derived from the passphrase with Argon2id using the
//! parameters recorded in the header. The header is bound as associated data.

use crate::error::{Result, TufError};
use crate::fsutil;
use crate::metadata::{Metadata, Role, RoleType, Root};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const KEY_TYPE_ED25519: &str = "ed25519";
pub const PEM_TAG: &str = "UPDRAFT ENCRYPTED PRIVATE KEY";

const BLOB_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + 12 + SALT_LEN + NONCE_LEN;
const SEED_LEN: usize = 32;
const TAG_LEN: usize = 16;
/// Upper bound on the memory cost accepted from a key file (1 GiB).
const MAX_M_COST_KIB: u32 = 1 << 20;

// =============================================================================
// Public Keys & Signatures
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    /// Hex-encoded 32-byte Ed25519 public key.
    pub public: String,
}

/// A public key as embedded in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: String,
    pub scheme: String,
    pub keyval: KeyVal,
}

impl PublicKey {
    pub fn ed25519(key: &VerifyingKey) -> Self {
        Self {
            keytype: KEY_TYPE_ED25519.to_string(),
            scheme: KEY_TYPE_ED25519.to_string(),
            keyval: KeyVal {
                public: hex::encode(key.to_bytes()),
            },
        }
    }

    /// Hex SHA-256 of the canonical JSON of this key.
    pub fn key_id(&self) -> String {
        // `Value` objects serialize with sorted keys and no whitespace.
        let canonical = serde_json::json!({
            "keytype": self.keytype,
            "scheme": self.scheme,
            "keyval": { "public": self.keyval.public },
        });
        fsutil::sha256_hex(canonical.to_string().as_bytes())
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        if self.keytype != KEY_TYPE_ED25519 || self.scheme != KEY_TYPE_ED25519 {
            return None;
        }
        let bytes: [u8; 32] = hex::decode(&self.keyval.public).ok()?.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

/// One signature over the canonical bytes of a signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    /// Hex-encoded 64-byte Ed25519 signature.
    pub sig: String,
}

// =============================================================================
// Key Pairs
// =============================================================================

/// An Ed25519 signing key and its key id.
///
/// The secret half is zeroized on drop and never printed.
#[derive(Clone)]
pub struct KeyPair {
    key_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let key_id = PublicKey::ed25519(&signing_key.verifying_key()).key_id();
        Self {
            key_id,
            signing_key,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::ed25519(&self.signing_key.verifying_key())
    }
}

/// Sign `data` with `key`.
pub fn sign(data: &[u8], key: &KeyPair) -> Signature {
    let signature = key.signing_key.sign(data);
    Signature {
        keyid: key.key_id.clone(),
        sig: hex::encode(signature.to_bytes()),
    }
}

/// Check one signature. Malformed keys or signatures simply fail.
pub fn verify(data: &[u8], signature: &Signature, key: &PublicKey) -> bool {
    let Some(verifying_key) = key.verifying_key() else {
        return false;
    };
    let Some(bytes) = hex::decode(&signature.sig)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
    else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&bytes);
    verifying_key.verify(data, &signature).is_ok()
}

// =============================================================================
// Threshold Verification
// =============================================================================

/// Count distinct authorized keys with valid signatures on `document` for
/// `role`, and fail unless the count meets the role threshold in `root`.
///
/// Returns the number of valid signatures.
pub fn verify_threshold<T: Role>(
    document: &Metadata<T>,
    role: RoleType,
    root: &Root,
) -> Result<u32> {
    let role_keys = root.role_keys(role).ok_or_else(|| {
        TufError::SignatureInvalid(format!("role '{}' is not defined in root", role))
    })?;
    let data = document.canonical_bytes()?;

    let mut valid = BTreeSet::new();
    for signature in &document.signatures {
        if valid.contains(signature.keyid.as_str())
            || !role_keys.keyids.iter().any(|id| *id == signature.keyid)
        {
            continue;
        }
        let Some(key) = root.key(&signature.keyid) else {
            continue;
        };
        if verify(&data, signature, key) {
            valid.insert(signature.keyid.as_str());
        }
    }

    let valid = valid.len() as u32;
    if valid < role_keys.threshold {
        return Err(TufError::ThresholdNotMet {
            role,
            required: role_keys.threshold,
            valid,
        });
    }
    Ok(valid)
}

/// Whether `document` carries enough valid signatures for its own role.
pub fn authentic<T: Role>(document: &Metadata<T>, root: &Root) -> bool {
    verify_threshold(document, T::TYPE, root).is_ok()
}

// =============================================================================
// Encrypted Private Keys
// =============================================================================

/// Argon2id cost parameters recorded in every key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

fn derive_key(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| TufError::Decryption(format!("invalid KDF parameters: {}", e)))?;
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| TufError::Decryption(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Export `key` as an encrypted PEM block using default KDF costs.
pub fn export_private(key: &KeyPair, passphrase: &str) -> Result<String> {
    export_private_with(key, passphrase, &KdfParams::default())
}

pub fn export_private_with(key: &KeyPair, passphrase: &str, kdf: &KdfParams) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(BLOB_VERSION);
    header.extend_from_slice(&kdf.m_cost.to_be_bytes());
    header.extend_from_slice(&kdf.t_cost.to_be_bytes());
    header.extend_from_slice(&kdf.p_cost.to_be_bytes());
    header.extend_from_slice(&salt);
    header.extend_from_slice(&nonce);

    let aes_key = derive_key(passphrase, &salt, kdf)?;
    let cipher = Aes256Gcm::new_from_slice(aes_key.as_slice())
        .map_err(|e| TufError::Serialization(format!("cipher setup: {}", e)))?;
    let seed = Zeroizing::new(key.signing_key.to_bytes());
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: seed.as_slice(),
                aad: &header,
            },
        )
        .map_err(|e| TufError::Serialization(format!("key encryption failed: {}", e)))?;

    let mut blob = header;
    blob.extend_from_slice(&ciphertext);
    Ok(pem::encode(&pem::Pem::new(PEM_TAG, blob)))
}

/// Decrypt a key exported by [`export_private`].
///
/// A wrong passphrase and a tampered blob are indistinguishable; both
/// fail with [`TufError::Decryption`].
pub fn import_private(pem_text: &str, passphrase: &str) -> Result<KeyPair> {
    let block = pem::parse(pem_text).map_err(|e| TufError::Decryption(e.to_string()))?;
    if block.tag() != PEM_TAG {
        return Err(TufError::Decryption(format!(
            "expected a '{}' block, found '{}'",
            PEM_TAG,
            block.tag()
        )));
    }
    let blob = block.contents();
    if blob.len() != HEADER_LEN + SEED_LEN + TAG_LEN {
        return Err(TufError::Decryption("key blob has the wrong length".into()));
    }
    if blob[0] != BLOB_VERSION {
        return Err(TufError::Decryption(format!(
            "unsupported key blob version {}",
            blob[0]
        )));
    }

    let be_u32 =
        |at: usize| u32::from_be_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]]);
    let kdf = KdfParams {
        m_cost: be_u32(1),
        t_cost: be_u32(5),
        p_cost: be_u32(9),
    };
    if kdf.m_cost > MAX_M_COST_KIB {
        return Err(TufError::Decryption("KDF memory cost too large".into()));
    }
    let (header, ciphertext) = blob.split_at(HEADER_LEN);
    let salt = &header[13..13 + SALT_LEN];
    let nonce = &header[13 + SALT_LEN..];

    let aes_key = derive_key(passphrase, salt, &kdf)?;
    let cipher = Aes256Gcm::new_from_slice(aes_key.as_slice())
        .map_err(|e| TufError::Decryption(e.to_string()))?;
    let seed = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| TufError::Decryption("wrong passphrase or corrupted key file".into()))?;

    let seed: Zeroizing<[u8; SEED_LEN]> = Zeroizing::new(
        seed.as_slice()
            .try_into()
            .map_err(|_| TufError::Decryption("decrypted seed has the wrong length".into()))?,
    );
    Ok(KeyPair::from_signing_key(SigningKey::from_bytes(&seed)))
}

// =============================================================================
// Key Files
// =============================================================================

/// `{keys_dir}/{role}_private_key.pem`
pub fn key_file_path(keys_dir: &Path, role: RoleType) -> PathBuf {
    keys_dir.join(format!("{}_private_key.pem", role))
}

/// Write an exported key, readable by the owner only.
pub fn write_key_file(keys_dir: &Path, role: RoleType, pem_text: &str) -> Result<PathBuf> {
    let path = key_file_path(keys_dir, role);
    fsutil::write_private_atomic(&path, pem_text.as_bytes())?;
    Ok(path)
}

pub fn read_key_file(keys_dir: &Path, role: RoleType) -> Result<String> {
    let path = key_file_path(keys_dir, role);
    let bytes = fsutil::read(&path)?;
    String::from_utf8(bytes)
        .map_err(|_| TufError::Decryption(format!("{} is not UTF-8", path.display())))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{expires_in, Targets};

    const LIGHT: KdfParams = KdfParams {
        m_cost: 1024,
        t_cost: 1,
        p_cost: 1,
    };

    fn root_with(keys: &[&KeyPair], threshold: u32) -> Root {
        let mut root = Root::new(expires_in(365));
        for key in keys {
            root.add_key(RoleType::Targets, key.public_key()).unwrap();
        }
        root.set_threshold(RoleType::Targets, threshold).unwrap();
        root
    }

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate();
        let sig = sign(b"payload", &key);
        assert_eq!(sig.keyid, key.key_id());
        assert!(verify(b"payload", &sig, &key.public_key()));
        assert!(!verify(b"payload!", &sig, &key.public_key()));

        let other = KeyPair::generate();
        assert!(!verify(b"payload", &sig, &other.public_key()));
    }

    #[test]
    fn test_key_id_is_stable_and_hex() {
        let key = KeyPair::generate();
        let id = key.public_key().key_id();
        assert_eq!(id, key.key_id());
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = KeyPair::generate();
        let debug = format!("{:?}", key);
        assert!(debug.contains(key.key_id()));
        assert!(!debug.contains(&hex::encode(key.signing_key.to_bytes())));
    }

    #[test]
    fn test_threshold_counts_distinct_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let root = root_with(&[&a, &b], 2);

        let mut doc = Metadata::new(Targets::new(expires_in(7)));
        doc.sign(&a).unwrap();
        // A duplicate signature from the same key counts once.
        let dup = doc.signatures[0].clone();
        doc.signatures.push(dup);
        let err = verify_threshold(&doc, RoleType::Targets, &root).unwrap_err();
        assert!(matches!(
            err,
            TufError::ThresholdNotMet {
                required: 2,
                valid: 1,
                ..
            }
        ));

        doc.sign(&b).unwrap();
        assert_eq!(verify_threshold(&doc, RoleType::Targets, &root).unwrap(), 2);
        assert!(authentic(&doc, &root));
    }

    #[test]
    fn test_unauthorized_key_is_ignored() {
        let a = KeyPair::generate();
        let intruder = KeyPair::generate();
        let root = root_with(&[&a], 1);

        let mut doc = Metadata::new(Targets::new(expires_in(7)));
        doc.sign(&intruder).unwrap();
        assert!(!authentic(&doc, &root));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let a = KeyPair::generate();
        let root = root_with(&[&a], 1);
        let mut doc = Metadata::new(Targets::new(expires_in(7)));
        doc.sign(&a).unwrap();
        doc.signed.version = 2;
        assert!(!authentic(&doc, &root));
    }

    #[test]
    fn test_export_import_round_trip() {
        let key = KeyPair::generate();
        let pem_text = export_private_with(&key, "hunter2", &LIGHT).unwrap();
        assert!(pem_text.contains(PEM_TAG));

        let restored = import_private(&pem_text, "hunter2").unwrap();
        assert_eq!(restored.key_id(), key.key_id());
        let sig = sign(b"x", &restored);
        assert!(verify(b"x", &sig, &key.public_key()));
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let key = KeyPair::generate();
        let pem_text = export_private_with(&key, "right", &LIGHT).unwrap();
        let err = import_private(&pem_text, "wrong").unwrap_err();
        assert!(matches!(err, TufError::Decryption(_)));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let key = KeyPair::generate();
        let pem_text = export_private_with(&key, "pw", &LIGHT).unwrap();
        let mut block = pem::parse(&pem_text).unwrap().contents().to_vec();
        let last = block.len() - 1;
        block[last] ^= 0x01;
        let tampered = pem::encode(&pem::Pem::new(PEM_TAG, block));
        assert!(matches!(
            import_private(&tampered, "pw"),
            Err(TufError::Decryption(_))
        ));

        let other = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![0u8; 8]));
        assert!(matches!(
            import_private(&other, "pw"),
            Err(TufError::Decryption(_))
        ));
    }

    #[test]
    fn test_key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate();
        let pem_text = export_private_with(&key, "pw", &LIGHT).unwrap();
        let path = write_key_file(dir.path(), RoleType::Snapshot, &pem_text).unwrap();
        assert!(path.ends_with("snapshot_private_key.pem"));

        let read_back = read_key_file(dir.path(), RoleType::Snapshot).unwrap();
        assert_eq!(import_private(&read_back, "pw").unwrap().key_id(), key.key_id());
    }
}
