//! Terminal implementations of the core's `Confirm` and `Progress`
//! capabilities, plus passphrase input.

use crate::colors::{bold, status_label, yellow};
use crate::error::CliError;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use updraft_core::{Confirm, DownloadProgress, Progress};

// =============================================================================
// Confirmation
// =============================================================================

/// `y`/`yes` (any case) confirms; everything else, including an empty
/// line, declines.
pub fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Asks on stderr and reads one line from stdin.
#[derive(Debug, Default)]
pub struct TerminalConfirm {
    assume_yes: bool,
}

impl TerminalConfirm {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{} {} [y/N] ", yellow("?"), bold(prompt));
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(_) => parse_answer(&line),
            Err(_) => false,
        }
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Percent bar for sized downloads, byte spinner for empty ones.
///
/// The bar is created on the first update, once the kind is known.
pub struct TerminalProgress {
    label: String,
    bar: Option<ProgressBar>,
}

impl TerminalProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bar: None,
        }
    }

    fn bar_for(&mut self, progress: DownloadProgress) -> &ProgressBar {
        let label = &self.label;
        self.bar.get_or_insert_with(|| match progress {
            DownloadProgress::Percent(_) => {
                let pb = ProgressBar::new(100);
                let template = "{prefix:.bold} [{bar:30.cyan}] {pos:>3}%";
                if let Ok(style) = ProgressStyle::default_bar().template(template) {
                    pb.set_style(style.progress_chars("=> "));
                }
                pb.set_prefix(label.clone());
                pb
            }
            DownloadProgress::Indeterminate { .. } => {
                let pb = ProgressBar::new_spinner();
                let template = "{spinner:.green} {prefix:.bold} {msg}";
                if let Ok(style) = ProgressStyle::default_spinner().template(template) {
                    pb.set_style(style);
                }
                pb.set_prefix(label.clone());
                pb
            }
        })
    }
}

impl Progress for TerminalProgress {
    fn update(&mut self, progress: DownloadProgress) {
        let bar = self.bar_for(progress);
        match progress {
            DownloadProgress::Percent(p) => bar.set_position(u64::from(p)),
            DownloadProgress::Indeterminate { bytes } => {
                bar.set_message(format!("{} bytes", bytes));
                bar.tick();
            }
        }
    }

    fn close(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Passphrases
// =============================================================================

/// Read the key passphrase from `env_var`, or prompt for it without echo.
/// With `confirm`, an interactive passphrase must be typed twice.
pub fn read_passphrase(env_var: &str, confirm: bool) -> Result<String, CliError> {
    if let Ok(value) = std::env::var(env_var) {
        if value.is_empty() {
            return Err(CliError::Input(format!("{} is set but empty", env_var)));
        }
        return Ok(value);
    }

    let prompt = format!("{} Key passphrase: ", status_label("Prompt"));
    let first = rpassword::prompt_password(prompt)
        .map_err(|e| CliError::Input(format!("failed to read passphrase: {}", e)))?;
    if first.is_empty() {
        return Err(CliError::Input("passphrase cannot be empty".to_string()));
    }
    if confirm {
        let prompt = format!("{} Repeat passphrase: ", status_label("Prompt"));
        let second = rpassword::prompt_password(prompt)
            .map_err(|e| CliError::Input(format!("failed to read passphrase: {}", e)))?;
        if first != second {
            return Err(CliError::Input("passphrases do not match".to_string()));
        }
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer("  YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("no"));
        assert!(!parse_answer("yep"));
    }

    #[test]
    fn assume_yes_never_reads_stdin() {
        let mut confirm = TerminalConfirm::new(true);
        assert!(confirm.confirm("Download app.exe?"));
    }

    #[test]
    fn passphrase_from_environment() {
        let var = "UPDRAFT_TEST_PASSPHRASE_FROM_ENV";
        std::env::set_var(var, "hunter2");
        assert_eq!(read_passphrase(var, true).unwrap(), "hunter2");

        std::env::set_var(var, "");
        assert!(matches!(read_passphrase(var, false), Err(CliError::Input(_))));
        std::env::remove_var(var);
    }

    #[test]
    fn progress_switches_on_first_update() {
        let mut progress = TerminalProgress::new("app.exe");
        progress.update(DownloadProgress::Percent(10));
        progress.update(DownloadProgress::Percent(100));
        assert_eq!(progress.bar.as_ref().map(|b| b.position()), Some(100));
        progress.close();
        assert!(progress.bar.is_none());
    }
}
