//! Configuration file parsing for `updraft.toml`.
//!
//! Searches current directory then ancestors, falling back to
//! `~/.config/updraft/updraft.toml` if no project-level file is found.
//! Relative paths in a file are resolved against that file's directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use updraft_core::repository::{DEFAULT_EXPIRY_DAYS, DEFAULT_ROOT_EXPIRY_DAYS};
use updraft_core::RepositoryConfig;

pub const CONFIG_FILE: &str = "updraft.toml";

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct UpdraftConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub repository: RepositorySection,
}

/// `[client]`: where updates come from and where they land.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    pub base_url: Option<String>,
    pub metadata_dir: PathBuf,
    pub download_dir: PathBuf,
    pub timeout_secs: u64,
    pub chunk_size: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            base_url: None,
            metadata_dir: PathBuf::from("client-metadata"),
            download_dir: PathBuf::from("downloads"),
            timeout_secs: 30,
            chunk_size: 4096,
        }
    }
}

impl ClientSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[repository]`: authoring-side locations and metadata lifetimes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RepositorySection {
    pub repo_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub expiry_days: i64,
    pub root_expiry_days: i64,
    /// Environment variable holding the key passphrase.
    pub passphrase_env: String,
}

impl Default for RepositorySection {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("repository"),
            keys_dir: PathBuf::from("keys"),
            expiry_days: DEFAULT_EXPIRY_DAYS,
            root_expiry_days: DEFAULT_ROOT_EXPIRY_DAYS,
            passphrase_env: "UPDRAFT_KEY_PASSPHRASE".to_string(),
        }
    }
}

impl RepositorySection {
    pub fn to_repository_config(&self) -> RepositoryConfig {
        let mut config = RepositoryConfig::new(&self.repo_dir, &self.keys_dir);
        config.expiry_days = self.expiry_days;
        config.root_expiry_days = self.root_expiry_days;
        config
    }
}

impl UpdraftConfig {
    /// Load config from `updraft.toml`, searching current dir then parents.
    /// Returns `Default` when no file is found.
    pub fn load() -> Result<Self, String> {
        Ok(Self::load_with_path()?.map(|(_path, cfg)| cfg).unwrap_or_default())
    }

    /// Load config and return the path to the config file that was found.
    pub fn load_with_path() -> Result<Option<(PathBuf, Self)>, String> {
        match Self::find() {
            Some(path) => Self::load_from(&path).map(|cfg| Some((path, cfg))),
            None => Ok(None),
        }
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        let mut cfg: Self = toml::from_str(&content)
            .map_err(|e| format!("invalid toml in '{}': {}", path.display(), e))?;
        if let Some(base) = path.parent() {
            cfg.resolve_relative_to(base);
        }
        Ok(cfg)
    }

    fn find() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.is_file() {
                return Some(config_path);
            }
            if !dir.pop() {
                break;
            }
        }
        let global = dirs::home_dir()?
            .join(".config")
            .join("updraft")
            .join(CONFIG_FILE);
        global.is_file().then_some(global)
    }

    /// Parse a TOML string directly. Paths stay as written.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [
            &mut self.client.metadata_dir,
            &mut self.client.download_dir,
            &mut self.repository.repo_dir,
            &mut self.repository.keys_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// A commented `updraft.toml` with every default spelled out.
    pub fn default_template() -> &'static str {
        r#"# Updraft configuration

[client]
# base_url = "https://updates.example.com"
metadata_dir = "client-metadata"
download_dir = "downloads"
timeout_secs = 30
chunk_size = 4096

[repository]
repo_dir = "repository"
keys_dir = "keys"
expiry_days = 7
root_expiry_days = 365
passphrase_env = "UPDRAFT_KEY_PASSPHRASE"
"#
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_client_section() {
        let toml_str = r#"
[client]
base_url = "http://127.0.0.1:8001"
timeout_secs = 5
"#;
        let cfg = UpdraftConfig::from_toml(toml_str).expect("should parse");
        assert_eq!(cfg.client.base_url.as_deref(), Some("http://127.0.0.1:8001"));
        assert_eq!(cfg.client.timeout(), Duration::from_secs(5));
        // Unset keys keep their defaults.
        assert_eq!(cfg.client.chunk_size, 4096);
        assert_eq!(cfg.client.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn parse_repository_section() {
        let toml_str = r#"
[repository]
repo_dir = "/srv/updates"
expiry_days = 1
passphrase_env = "MY_PASS"
"#;
        let cfg = UpdraftConfig::from_toml(toml_str).expect("should parse");
        assert_eq!(cfg.repository.repo_dir, PathBuf::from("/srv/updates"));
        assert_eq!(cfg.repository.expiry_days, 1);
        assert_eq!(cfg.repository.root_expiry_days, 365);
        assert_eq!(cfg.repository.passphrase_env, "MY_PASS");

        let repo = cfg.repository.to_repository_config();
        assert_eq!(repo.expiry_days, 1);
        assert_eq!(repo.metadata_dir(), PathBuf::from("/srv/updates/metadata"));
    }

    #[test]
    fn empty_string_returns_default() {
        let cfg = UpdraftConfig::from_toml("").expect("empty toml is valid");
        assert_eq!(cfg, UpdraftConfig::default());
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(UpdraftConfig::from_toml("[broken").is_err());
        assert!(UpdraftConfig::from_toml("[client]\ntimeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn default_template_matches_defaults() {
        let cfg = UpdraftConfig::from_toml(UpdraftConfig::default_template())
            .expect("default template must be valid toml");
        assert_eq!(cfg, UpdraftConfig::default());
    }

    #[test]
    fn load_from_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[client]\nmetadata_dir = \"meta\"\ndownload_dir = \"/abs/downloads\"\n",
        )
        .unwrap();

        let cfg = UpdraftConfig::load_from(&path).unwrap();
        assert_eq!(cfg.client.metadata_dir, dir.path().join("meta"));
        assert_eq!(cfg.client.download_dir, PathBuf::from("/abs/downloads"));
        assert_eq!(cfg.repository.keys_dir, dir.path().join("keys"));
    }

    #[test]
    fn load_from_missing_file_is_error() {
        let err = UpdraftConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.contains("cannot read"));
    }
}
