//! Error types for stevedore.
//!
//! Each component owns a focused error enum; all of them fold into
//! [`StevedoreError`] so callers can use a single `Result` alias.

use std::path::PathBuf;
use thiserror::Error;

pub use crate::builder::BuildError;
pub use crate::cache::CacheError;
pub use crate::git::GitError;

/// Result type alias for stevedore operations.
pub type Result<T> = std::result::Result<T, StevedoreError>;

/// Main error type for stevedore.
#[derive(Error, Debug)]
pub enum StevedoreError {
    // Configuration errors
    #[error("Config file not found: {path:?}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Discovery errors
    #[error("Discovery failed for {path:?}: {reason}")]
    DiscoveryFailed { path: PathBuf, reason: String },

    #[error("Invalid image name '{name}': {reason}")]
    InvalidImageName { name: String, reason: String },

    #[error("No valid services found to build")]
    NoServices,

    // Component errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Build(#[from] BuildError),

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StevedoreError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }
}
