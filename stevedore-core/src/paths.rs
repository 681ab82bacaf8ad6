//! Centralized path configuration for stevedore.
//!
//! Cache backends never pick their own location: the root returned here is
//! handed to [`crate::cache::open_store`] by whoever builds the pipeline, so
//! tests can point it at a throwaway directory.

use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "STEVEDORE_CACHE_DIR";

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "build.yaml";

/// Get the cache root directory.
///
/// Resolution order:
/// 1. `STEVEDORE_CACHE_DIR` environment variable
/// 2. the per-user cache directory (`~/.cache/stevedore` on Linux)
/// 3. `<temp dir>/stevedore-cache`
pub fn cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::cache_dir()
        .map(|d| d.join("stevedore"))
        .unwrap_or_else(|| std::env::temp_dir().join("stevedore-cache"))
}

/// Directory for one cache backend under a cache root.
pub fn backend_dir(root: &Path, backend: &str) -> PathBuf {
    root.join(format!("{}-cache", backend))
}

/// Resolve a possibly relative service path against the working directory.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_dir_layout() {
        let root = PathBuf::from("/var/cache/stevedore");
        assert_eq!(backend_dir(&root, "layer"), PathBuf::from("/var/cache/stevedore/layer-cache"));
        assert_eq!(
            backend_dir(&root, "distributed"),
            PathBuf::from("/var/cache/stevedore/distributed-cache")
        );
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        let path = PathBuf::from("/srv/services/api");
        assert_eq!(absolute(&path), path);
    }

    #[test]
    fn test_absolute_joins_relative_paths() {
        let resolved = absolute(Path::new("services/api"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("services/api"));
    }
}
