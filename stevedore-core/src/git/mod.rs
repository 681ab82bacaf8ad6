//! Git change detection.
//!
//! [`GitTracker`] answers "which files under this service changed?" by
//! combining two signals, each cached in memory for a few minutes:
//!
//! - uncommitted changes (`git status --porcelain`)
//! - changes in the last `depth - 1` commits (`git diff --name-only`)
//!
//! Git itself sits behind the [`GitRunner`] trait so tests can script it.

mod cache;
mod tracker;

pub use cache::{GitCacheStats, GitResultCache, SignalKind, GIT_CACHE_TTL};
pub use tracker::{GitOutput, GitRunner, GitTracker, SystemGit};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Smallest commit depth the tracker will look at.
pub const MIN_DEPTH: u32 = 2;

/// Errors from git change detection.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("Not a git repository: {path:?}")]
    NotARepository { path: PathBuf },

    #[error("Service path is not a directory: {path:?}")]
    InvalidPath { path: PathBuf },

    #[error("git {command} failed (exit code {code:?}): {stderr}")]
    CommandFailed { command: String, code: Option<i32>, stderr: String },
}

/// Source of changed-file sets for a service directory.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Files changed under `service_path`, relative to the repository root.
    ///
    /// An empty list means "no changes". Errors are reserved for cases where
    /// no answer could be computed at all.
    async fn changed_files(&self, service_path: &Path, depth: u32) -> Result<Vec<String>, GitError>;
}

/// Clamp a requested depth to [`MIN_DEPTH`].
pub fn effective_depth(depth: u32) -> u32 {
    depth.max(MIN_DEPTH)
}
