//! Error type shared by the `updraft` and `updraft-repo` binaries.

use updraft_core::{FetchError, TufError};

pub const EXIT_FAILURE: i32 = 1;
/// Exit code for rejected (tampered, stale, or inconsistent) data.
pub const EXIT_SECURITY: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Input(String),

    #[error(transparent)]
    Core(#[from] TufError),
}

impl From<FetchError> for CliError {
    fn from(e: FetchError) -> Self {
        CliError::Core(TufError::Network(e))
    }
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Core(e) if e.is_security_failure() => EXIT_SECURITY,
            _ => EXIT_FAILURE,
        }
    }
}
