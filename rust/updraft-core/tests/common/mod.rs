//! Shared fixture: a file-system repository served through `file://` URLs.

#![allow(dead_code)]

use std::path::PathBuf;
use tempfile::TempDir;
use updraft_core::fetch::{HttpFetcher, DEFAULT_TIMEOUT};
use updraft_core::keys::{self, KdfParams, KeyPair};
use updraft_core::metadata::{Metadata, Role};
use updraft_core::{Artifact, Confirm, RepositoryConfig, RoleType, Updater};

pub const PASSPHRASE: &str = "integration passphrase";

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.repo_dir().join("metadata")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn repo_config(&self) -> RepositoryConfig {
        let mut config = RepositoryConfig::new(self.repo_dir(), self.dir.path().join("keys"));
        config.kdf = KdfParams {
            m_cost: 1024,
            t_cost: 1,
            p_cost: 1,
        };
        config
    }

    /// Write `body` to a scratch file and return it as `target_path`.
    pub fn artifact(&self, target_path: &str, body: &[u8]) -> Artifact {
        let src_dir = self.dir.path().join("src");
        std::fs::create_dir_all(&src_dir).unwrap();
        let source = src_dir.join(target_path.replace('/', "_"));
        std::fs::write(&source, body).unwrap();
        Artifact::new(target_path, source)
    }

    pub fn base_url(&self) -> String {
        format!("file://{}", self.repo_dir().display())
    }

    pub fn updater(&self) -> Updater {
        let fetcher = HttpFetcher::new(DEFAULT_TIMEOUT, 5).unwrap();
        Updater::new(
            &self.base_url(),
            &self.dir.path().join("client"),
            &self.download_dir(),
            Box::new(fetcher),
        )
    }

    /// A repository key, decrypted from its key file.
    pub fn key(&self, role: RoleType) -> KeyPair {
        let pem_text = keys::read_key_file(&self.repo_config().keys_dir, role).unwrap();
        keys::import_private(&pem_text, PASSPHRASE).unwrap()
    }

    pub fn read_repo<T: Role>(&self, filename: &str) -> Metadata<T> {
        Metadata::from_file(&self.metadata_dir().join(filename)).unwrap()
    }

    pub fn write_repo<T: Role>(&self, filename: &str, doc: &Metadata<T>) -> Vec<u8> {
        let bytes = doc.to_pretty_vec().unwrap();
        std::fs::write(self.metadata_dir().join(filename), &bytes).unwrap();
        bytes
    }

    /// Version recorded in the client's local copy of `filename`.
    pub fn client_version(&self, updater: &Updater, filename: &str) -> u64 {
        let raw = std::fs::read(updater.metadata_dir().join(filename)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        value["signed"]["version"].as_u64().unwrap()
    }
}

/// Answers every prompt with a fixed value and counts the prompts.
pub struct CountingConfirm {
    pub answer: bool,
    pub asked: usize,
}

impl CountingConfirm {
    pub fn new(answer: bool) -> Self {
        Self { answer, asked: 0 }
    }
}

impl Confirm for CountingConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        self.asked += 1;
        self.answer
    }
}
