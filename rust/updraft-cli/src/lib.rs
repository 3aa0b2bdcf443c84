//! Command-line front ends for updraft.
//!
//! `updraft` is the client (`tofu`, `download`, `info`); `updraft-repo`
//! authors a repository (`init`, `publish`, `rotate-root`). Both share
//! configuration, terminal prompts, and log setup from this crate.

pub mod colors;
pub mod config;
pub mod error;
pub mod ui;

use tracing_subscriber::EnvFilter;

/// Filter directive for a `-v` count: 0 error, 1 warn, 2 info, 3+ debug.
pub fn log_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    format!("updraft_core={level},updraft_cli={level}")
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
