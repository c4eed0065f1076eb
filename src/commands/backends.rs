//! List the available decision backends.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;

use crate::config::Config;
use crate::oracle::{resolve_backend, Backend};

/// Formats the backend list, marking the one that would be used.
pub(crate) fn format_backends(selected: Backend) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "\n{}", "Available backends:".bold());
    for backend in Backend::ALL {
        let marker = if backend == selected {
            "●".green()
        } else {
            "○".dimmed()
        };
        let _ = writeln!(
            &mut out,
            "  {marker} {:<12} {}",
            backend.to_string().cyan(),
            backend.description().dimmed()
        );
    }
    out
}

/// Entry point: prints the backends, marking the resolved default.
pub(crate) fn run() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;
    let selected = resolve_backend(&config, None)?;
    print!("{}", format_backends(selected));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_backends_lists_all() {
        let out = format_backends(Backend::Noop);
        for name in ["hosted", "claude-cli", "codex-cli", "noop"] {
            assert!(out.contains(name), "{name}");
        }
    }
}
