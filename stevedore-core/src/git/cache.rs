//! Short-lived in-memory cache of git query results.
//!
//! Entries are only checked on read; nothing sweeps them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a git result stays valid.
pub const GIT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Which git signal a cached result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Status,
    Diff,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Diff => "diff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    depth: u32,
    kind: SignalKind,
}

#[derive(Debug, Clone)]
struct GitCacheEntry {
    files: Vec<String>,
    timestamp: Instant,
    valid_until: Instant,
}

/// Entry counts per signal kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GitCacheStats {
    pub status_entries: usize,
    pub diff_entries: usize,
}

/// Result cache keyed by `(path, depth, kind)`.
#[derive(Debug)]
pub struct GitResultCache {
    entries: RwLock<HashMap<CacheKey, GitCacheEntry>>,
    ttl: Duration,
}

impl Default for GitResultCache {
    fn default() -> Self {
        Self::with_ttl(GIT_CACHE_TTL)
    }
}

impl GitResultCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    /// Cached files for a key, if present and still valid.
    pub fn get(&self, path: &Path, depth: u32, kind: SignalKind) -> Option<Vec<String>> {
        let key = CacheKey { path: path.to_path_buf(), depth, kind };
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&key)?;
        if Instant::now() >= entry.valid_until {
            return None;
        }
        debug!(
            path = %path.display(),
            depth,
            kind = kind.as_str(),
            age_ms = entry.timestamp.elapsed().as_millis() as u64,
            "Git cache hit"
        );
        Some(entry.files.clone())
    }

    pub fn insert(&self, path: &Path, depth: u32, kind: SignalKind, files: Vec<String>) {
        let now = Instant::now();
        debug!(
            path = %path.display(),
            depth,
            kind = kind.as_str(),
            files = files.len(),
            "Cached git result"
        );
        let key = CacheKey { path: path.to_path_buf(), depth, kind };
        let entry = GitCacheEntry { files, timestamp: now, valid_until: now + self.ttl };
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(key, entry);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        debug!("Git cache cleared");
    }

    pub fn stats(&self) -> GitCacheStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let status_entries = entries.keys().filter(|k| k.kind == SignalKind::Status).count();
        GitCacheStats { status_entries, diff_entries: entries.len() - status_entries }
    }
}
