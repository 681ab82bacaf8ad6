//! Cache maintenance commands.

use anyhow::{Context, Result};
use colored::Colorize;
use stevedore_core::cache::{open_store, CacheLevel, CacheStore};
use stevedore_core::paths;
use std::sync::Arc;

fn open(level: CacheLevel) -> Result<Arc<dyn CacheStore>> {
    let root = paths::cache_root();
    open_store(level, &root).with_context(|| format!("Failed to open cache at {}", root.display()))
}

/// Remove every expired entry from the selected backend.
pub fn cleanup(level: CacheLevel) -> Result<()> {
    let store = open(level)?;
    store.cleanup().context("Cache cleanup failed")?;
    println!("{} Cleaned up {} cache", "✓".green(), store.backend());
    Ok(())
}

/// Remove one service's entry. Clearing a missing entry succeeds.
pub fn clear(service: &str, level: CacheLevel) -> Result<()> {
    let store = open(level)?;
    store.clear(service).with_context(|| format!("Failed to clear cache entry for {}", service))?;
    println!("{} Cleared {} from {} cache", "✓".green(), service.cyan(), store.backend());
    Ok(())
}
