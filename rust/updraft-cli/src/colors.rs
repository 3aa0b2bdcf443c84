//! ANSI color helpers for terminal output.
//!
//! Colors are dropped when `NO_COLOR` is set or stderr is not a terminal.

use std::io::IsTerminal;
use std::sync::OnceLock;

fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
    })
}

fn paint(code: &str, s: &str) -> String {
    if enabled() {
        format!("\x1b[{}m{}\x1b[0m", code, s)
    } else {
        s.to_string()
    }
}

pub fn green(s: &str) -> String {
    paint("32", s)
}

pub fn red(s: &str) -> String {
    paint("31", s)
}

pub fn yellow(s: &str) -> String {
    paint("33", s)
}

pub fn cyan(s: &str) -> String {
    paint("36", s)
}

pub fn bold(s: &str) -> String {
    paint("1", s)
}

pub fn gray(s: &str) -> String {
    paint("90", s)
}

/// Right-aligned bold green label, e.g. `  Downloaded`.
pub fn status_label(label: &str) -> String {
    paint("1;32", &format!("{:>12}", label))
}

/// Right-aligned bold red label for rejections.
pub fn alert_label(label: &str) -> String {
    paint("1;31", &format!("{:>12}", label))
}
