//! Updraft Core
//!
//! Signed, rollback-resistant updates for a single executable artifact.
//!
//! A repository publishes four kinds of signed metadata (root, targets,
//! snapshot, timestamp). Clients trust a root once, then refresh the rest
//! in a fixed order and only download bytes that match what a threshold of
//! authorized keys signed.
//!
//! - [`metadata`]: the signed documents and their validation
//! - [`keys`]: Ed25519 keys, threshold checks, encrypted key files
//! - [`repository`]: authoring (`init`, `publish`, root rotation)
//! - [`client`]: trust bootstrap, refresh, and verified downloads
//! - [`fetch`]: transport, progress, and cancellation

pub mod client;
mod de;
pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod keys;
pub mod metadata;
pub mod repository;

pub use client::{TargetInfo, UpdateOutcome, Updater};
pub use error::{FetchError, Result, TufError};
pub use fetch::{
    AlwaysConfirm, CancelToken, ChannelProgress, Confirm, DownloadProgress, Fetcher, HttpFetcher,
    NoProgress, Progress,
};
pub use keys::{KdfParams, KeyPair};
pub use metadata::{Metadata, RoleType};
pub use repository::{
    init_repository, publish_update, rotate_root_key, Artifact, RepositoryConfig, RepositoryState,
};
