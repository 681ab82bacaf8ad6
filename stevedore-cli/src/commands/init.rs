//! Init command: write a sample build configuration.

use anyhow::{Context, Result};
use colored::Colorize;
use stevedore_core::BuildConfig;
use std::path::Path;

pub fn init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    BuildConfig::save_sample(output, force)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "{} Wrote sample configuration to {}",
        "✓".green(),
        output.display().to_string().cyan()
    );
    println!("  Edit it, then run {}", "stevedore build".bold());
    Ok(())
}
