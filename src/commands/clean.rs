//! Remove sandbox containers left behind by interrupted runs.
//!
//! Formatting is pure. IO happens only at the top level.

use anyhow::{Context, Result};
use bollard::Docker;
use colored::Colorize;

use crate::sandbox::remove_orphaned;

/// Format the clean results as a displayable string
pub(crate) fn format_results(removed: u32) -> String {
    if removed == 0 {
        format!("\n{} No managed containers found.\n", "ℹ".blue())
    } else {
        let noun = if removed == 1 { "container" } else { "containers" };
        format!(
            "\n{} Removed {} managed {noun}.\n",
            "✓".green(),
            removed.to_string().cyan()
        )
    }
}

/// Entry point: removes every managed container
pub(crate) async fn run() -> Result<()> {
    let docker = Docker::connect_with_local_defaults()
        .context("Failed to connect to Docker. Is Docker running?")?;
    let removed = remove_orphaned(&docker)
        .await
        .context("Failed to remove managed containers")?;
    print!("{}", format_results(removed));
    Ok(())
}
