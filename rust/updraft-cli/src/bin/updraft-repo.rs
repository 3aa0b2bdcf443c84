//! `updraft-repo`: create and maintain an update repository.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use updraft_cli::colors::{bold, cyan, gray, red, status_label, yellow};
use updraft_cli::config::UpdraftConfig;
use updraft_cli::error::CliError;
use updraft_cli::ui::read_passphrase;
use updraft_core::{
    init_repository, publish_update, rotate_root_key, Artifact, RepositoryConfig,
    RepositoryState, RoleType,
};

#[derive(Parser)]
#[command(name = "updraft-repo", version, about = "Author a signed update repository")]
struct Cli {
    /// Increase log output (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to updraft.toml (default: search upwards from the current dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository root (metadata is written under `metadata/`)
    #[arg(long, global = true)]
    repo_dir: Option<PathBuf>,

    /// Directory holding the encrypted role keys
    #[arg(long, global = true)]
    keys_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate keys and the first version of every role
    Init {
        /// Artifact to publish, as TARGET_PATH=LOCAL_FILE
        #[arg(long = "target", value_name = "PATH=FILE")]
        targets: Vec<Artifact>,
    },
    /// Add or replace targets and re-sign the metadata cycle
    Publish {
        /// Artifact to publish, as TARGET_PATH=LOCAL_FILE
        #[arg(long = "target", value_name = "PATH=FILE")]
        targets: Vec<Artifact>,

        /// Target path to drop from the targets metadata
        #[arg(long = "remove", value_name = "PATH")]
        removals: Vec<String>,
    },
    /// Replace a root key, co-signing the new root with the old keys
    RotateRoot {
        /// Key id of the root key being retired
        #[arg(long)]
        old_key_id: String,
    },
}

fn main() {
    let cli = Cli::parse();
    updraft_cli::init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {}", red("error:"), e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => UpdraftConfig::load_from(path),
        None => UpdraftConfig::load(),
    }
    .map_err(CliError::Config)?;

    let mut repo_config = config.repository.to_repository_config();
    if let Some(dir) = cli.repo_dir {
        repo_config.repo_dir = dir;
    }
    if let Some(dir) = cli.keys_dir {
        repo_config.keys_dir = dir;
    }
    let passphrase_env = config.repository.passphrase_env.as_str();

    match cli.command {
        Commands::Init { targets } => cmd_init(repo_config, &targets, passphrase_env),
        Commands::Publish { targets, removals } => {
            cmd_publish(repo_config, &targets, &removals, passphrase_env)
        }
        Commands::RotateRoot { old_key_id } => {
            cmd_rotate_root(repo_config, &old_key_id, passphrase_env)
        }
    }
}

fn cmd_init(
    config: RepositoryConfig,
    targets: &[Artifact],
    passphrase_env: &str,
) -> Result<(), CliError> {
    let passphrase = read_passphrase(passphrase_env, true)?;
    let keys_dir = config.keys_dir.clone();
    let state = init_repository(config, targets, &passphrase)?;

    println!(
        "{} repository at {}",
        status_label("Created"),
        cyan(&state.config().repo_dir.display().to_string())
    );
    for role in RoleType::ALL {
        for key_id in state.signer_ids(role) {
            println!("  {:<10} {}", role.as_str(), gray(&key_id));
        }
    }
    for artifact in targets {
        println!("{} {}", status_label("Added"), bold(&artifact.target_path));
    }
    println!(
        "{} keep {} offline; every key there is encrypted with your passphrase",
        yellow("note:"),
        keys_dir.display()
    );
    Ok(())
}

fn cmd_publish(
    config: RepositoryConfig,
    targets: &[Artifact],
    removals: &[String],
    passphrase_env: &str,
) -> Result<(), CliError> {
    if targets.is_empty() && removals.is_empty() {
        tracing::info!("no target changes; re-signing to extend expiry");
    }
    let passphrase = read_passphrase(passphrase_env, false)?;
    let mut state = RepositoryState::load(config, &passphrase)?;
    for path in removals {
        state.remove_target(path)?;
    }
    publish_update(&mut state, targets)?;

    for artifact in targets {
        println!("{} {}", status_label("Published"), bold(&artifact.target_path));
    }
    for path in removals {
        println!("{} {}", status_label("Removed"), bold(path));
    }
    println!(
        "{} targets v{}, snapshot v{}, timestamp v{}",
        status_label("Signed"),
        state.targets.version(),
        state.snapshot.version(),
        state.timestamp.version()
    );
    Ok(())
}

fn cmd_rotate_root(
    config: RepositoryConfig,
    old_key_id: &str,
    passphrase_env: &str,
) -> Result<(), CliError> {
    let passphrase = read_passphrase(passphrase_env, false)?;
    let mut state = RepositoryState::load(config, &passphrase)?;
    let new_key_id = rotate_root_key(&mut state, old_key_id)?;

    println!(
        "{} root v{}: {} replaced by {}",
        status_label("Rotated"),
        state.root.version(),
        gray(old_key_id),
        bold(&new_key_id)
    );
    Ok(())
}
