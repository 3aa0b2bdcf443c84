//! `updraft`: fetch verified updates from a repository.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use updraft_cli::colors::{alert_label, bold, cyan, gray, green, red, status_label, yellow};
use updraft_cli::config::UpdraftConfig;
use updraft_cli::error::{CliError, EXIT_SECURITY};
use updraft_cli::ui::{TerminalConfirm, TerminalProgress};
use updraft_core::{CancelToken, HttpFetcher, Progress, UpdateOutcome, Updater};

#[derive(Parser)]
#[command(name = "updraft", version, about = "Download signed, rollback-resistant updates")]
struct Cli {
    /// Increase log output (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Repository base URL (overrides `client.base_url`)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Path to updraft.toml (default: search upwards from the current dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where trusted metadata is kept
    #[arg(long, global = true)]
    metadata_dir: Option<PathBuf>,

    /// Where downloaded targets are written
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trust the repository's current root (first use only)
    Tofu,
    /// Refresh metadata and download a target if it changed
    Download {
        /// Target path as listed in the targets metadata
        target: String,

        /// Do not ask before downloading
        #[arg(short, long)]
        yes: bool,
    },
    /// Refresh metadata and show what a target should look like
    Info {
        target: String,
    },
    /// Print a commented updraft.toml with the default settings
    ConfigTemplate,
}

fn main() {
    let cli = Cli::parse();
    updraft_cli::init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        let code = e.exit_code();
        if code == EXIT_SECURITY {
            eprintln!("{} {}", alert_label("Rejected"), e);
            eprintln!(
                "{}",
                gray("the repository served data that failed verification; nothing was trusted")
            );
        } else {
            eprintln!("{} {}", red("error:"), e);
        }
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Commands::ConfigTemplate = cli.command {
        print!("{}", UpdraftConfig::default_template());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => UpdraftConfig::load_from(path),
        None => UpdraftConfig::load(),
    }
    .map_err(CliError::Config)?;
    let mut updater = build_updater(&cli, &config)?;

    match cli.command {
        Commands::Tofu => cmd_tofu(&mut updater),
        Commands::Download { target, yes } => cmd_download(&mut updater, &target, yes),
        Commands::Info { target } => cmd_info(&mut updater, &target),
        Commands::ConfigTemplate => Ok(()),
    }
}

fn build_updater(cli: &Cli, config: &UpdraftConfig) -> Result<Updater, CliError> {
    let base_url = cli
        .url
        .clone()
        .or_else(|| config.client.base_url.clone())
        .ok_or_else(|| {
            CliError::Input("no repository URL; pass --url or set client.base_url".to_string())
        })?;
    let metadata_dir = cli
        .metadata_dir
        .clone()
        .unwrap_or_else(|| config.client.metadata_dir.clone());
    let download_dir = cli
        .download_dir
        .clone()
        .unwrap_or_else(|| config.client.download_dir.clone());

    let fetcher = HttpFetcher::new(config.client.timeout(), config.client.chunk_size)?;
    Ok(Updater::new(
        &base_url,
        &metadata_dir,
        &download_dir,
        Box::new(fetcher),
    ))
}

fn cmd_tofu(updater: &mut Updater) -> Result<(), CliError> {
    eprintln!(
        "{} trusting the root served by {} without prior verification",
        yellow("warning:"),
        cyan(updater.base_url())
    );
    updater.bootstrap_tofu()?;
    let version = updater.trusted_root().map(|r| r.version()).unwrap_or(0);
    println!(
        "{} root v{} from {}",
        status_label("Trusted"),
        version,
        cyan(updater.base_url())
    );
    Ok(())
}

fn cmd_download(updater: &mut Updater, target: &str, yes: bool) -> Result<(), CliError> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }

    let mut confirm = TerminalConfirm::new(yes);
    let mut progress = TerminalProgress::new(target);
    let outcome = updater.update(target, &mut confirm, &mut progress, &cancel)?;
    progress.close();

    match outcome {
        UpdateOutcome::Cached(path) => println!(
            "{} {} {}",
            status_label("Fresh"),
            bold(target),
            gray(&format!("(already at {})", path.display()))
        ),
        UpdateOutcome::Downloaded(path) => println!(
            "{} {} to {}",
            status_label("Downloaded"),
            bold(target),
            path.display()
        ),
        UpdateOutcome::Declined => println!("{} {}", status_label("Skipped"), bold(target)),
    }
    Ok(())
}

fn cmd_info(updater: &mut Updater, target: &str) -> Result<(), CliError> {
    updater.refresh()?;
    let info = updater.get_target_info(target)?;
    println!("{}", bold(&info.path));
    println!("  length: {} bytes", info.length);
    for (algorithm, digest) in &info.hashes {
        println!("  {}: {}", algorithm, digest);
    }
    match updater.find_cached(&info) {
        Some(path) => println!("  cached: {}", green(&path.display().to_string())),
        None => println!("  cached: {}", gray("no")),
    }
    if let Some(targets) = updater.trusted_targets() {
        println!("  {}", gray(&format!("targets metadata v{}", targets.version())));
    }
    Ok(())
}
