//! JSON-file cache backend.
//!
//! One document per service, named `<service><suffix>` inside the backend
//! directory. Used directly for the registry and layer levels and as the
//! durable tier of the distributed cache.

use super::{validate_key, CacheEntry, CacheError, CacheStore};
use crate::observability::metrics::record_cache_lookup;
use crate::paths;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File-per-service cache.
#[derive(Debug)]
pub struct FileCache {
    /// Directory holding the JSON documents
    cache_dir: PathBuf,
    /// File name suffix following the service name
    suffix: &'static str,
    /// Label used in logs and metrics
    backend: &'static str,
}

impl FileCache {
    /// Registry-level cache: `<root>/registry-cache/<service>.json`.
    pub fn registry(root: &Path) -> Result<Self, CacheError> {
        Self::with_layout(paths::backend_dir(root, "registry"), ".json", "registry")
    }

    /// Layer-level cache: `<root>/layer-cache/<service>-layer.json`.
    pub fn layer(root: &Path) -> Result<Self, CacheError> {
        Self::with_layout(paths::backend_dir(root, "layer"), "-layer.json", "layer")
    }

    /// Creates a file cache with a custom directory and suffix.
    pub fn with_layout(
        cache_dir: PathBuf,
        suffix: &'static str,
        backend: &'static str,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            CacheError::CacheDirectoryError(format!(
                "Failed to create {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self { cache_dir, suffix, backend })
    }

    /// Directory holding this backend's documents.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path of a service's document.
    fn entry_path(&self, service_name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", service_name, self.suffix))
    }

    /// Recover the service name from a document file name.
    fn service_name_of<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        file_name.strip_suffix(self.suffix)
    }

    /// Reads and validates a document. `None` covers every miss.
    fn lookup(&self, service_name: &str) -> Option<CacheEntry> {
        if validate_key(service_name).is_err() {
            debug!(backend = self.backend, service = service_name, "Cache miss: invalid key");
            return None;
        }

        let path = self.entry_path(service_name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    debug!(backend = self.backend, service = service_name, "Cache miss: not found");
                } else {
                    debug!(
                        backend = self.backend,
                        service = service_name,
                        error = %e,
                        "Cache miss: unreadable"
                    );
                }
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(
                    backend = self.backend,
                    service = service_name,
                    error = %e,
                    "Cache miss: invalid cache data"
                );
                return None;
            }
        };

        if entry.is_expired() {
            debug!(
                backend = self.backend,
                service = service_name,
                age_secs = entry.age_at(chrono::Utc::now()).as_secs(),
                "Cache miss: expired"
            );
            if let Err(e) = remove_if_present(&path) {
                warn!(
                    backend = self.backend,
                    service = service_name,
                    error = %e,
                    "Failed to evict expired entry"
                );
            }
            return None;
        }

        Some(entry)
    }
}

impl CacheStore for FileCache {
    fn backend(&self) -> &'static str {
        self.backend
    }

    fn get(&self, service_name: &str) -> Option<CacheEntry> {
        let entry = self.lookup(service_name);
        record_cache_lookup(self.backend, entry.is_some());
        entry
    }

    fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        validate_key(&entry.service_name)?;

        let json = serde_json::to_string_pretty(entry)?;
        fs::write(self.entry_path(&entry.service_name), json)?;

        debug!(
            backend = self.backend,
            service = %entry.service_name,
            hash = %entry.image_hash,
            "Cache set"
        );
        Ok(())
    }

    fn clear(&self, service_name: &str) -> Result<(), CacheError> {
        validate_key(service_name)?;
        remove_if_present(&self.entry_path(service_name))?;
        debug!(backend = self.backend, service = service_name, "Cache entry cleared");
        Ok(())
    }

    fn cleanup(&self) -> Result<(), CacheError> {
        let mut removed = 0usize;

        for dir_entry in fs::read_dir(&self.cache_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }

            let file_name = dir_entry.file_name();
            let Some(service_name) = file_name.to_str().and_then(|n| self.service_name_of(n))
            else {
                continue;
            };

            if self.lookup(service_name).is_none() {
                remove_if_present(&path)?;
                removed += 1;
            }
        }

        info!(backend = self.backend, removed, "Cache cleanup complete");
        Ok(())
    }
}

/// Delete a file, treating "already gone" as success.
fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(name: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(name, format!("{:064x}", 42), ttl)
    }

    #[test]
    fn test_cache_miss() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        assert!(cache.get("api").is_none());
    }

    #[test]
    fn test_round_trip() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        let mut written = entry("api", Duration::from_secs(3600));
        written.layer_hash = Some("layer123".to_string());
        cache.set(&written).unwrap();

        assert_eq!(cache.get("api"), Some(written));
        assert!(cache.cache_dir().join("api.json").exists());
    }

    #[test]
    fn test_layer_suffix() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::layer(root.path()).unwrap();

        cache.set(&entry("worker", Duration::from_secs(60))).unwrap();

        assert!(cache.cache_dir().join("worker-layer.json").exists());
        assert!(cache.get("worker").is_some());
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        cache.set(&entry("api", Duration::from_secs(1))).unwrap();
        thread::sleep(Duration::from_secs(2));

        assert!(cache.get("api").is_none());
        assert!(!cache.cache_dir().join("api.json").exists());
        cache.cleanup().unwrap();
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        fs::write(cache.cache_dir().join("api.json"), "{not json").unwrap();

        assert!(cache.get("api").is_none());
        // Reads never delete unparsable documents; cleanup does.
        assert!(cache.cache_dir().join("api.json").exists());
        cache.cleanup().unwrap();
        assert!(!cache.cache_dir().join("api.json").exists());
    }

    #[test]
    fn test_cleanup_keeps_fresh_entries() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        let mut stale = entry("old", Duration::from_secs(60));
        stale.timestamp -= chrono::Duration::seconds(120);
        cache.set(&stale).unwrap();
        cache.set(&entry("fresh", Duration::from_secs(60))).unwrap();

        cache.cleanup().unwrap();

        assert!(!cache.cache_dir().join("old.json").exists());
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn test_cleanup_ignores_foreign_files() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::layer(root.path()).unwrap();

        fs::write(cache.cache_dir().join("notes.txt"), "keep me").unwrap();
        cache.cleanup().unwrap();

        assert!(cache.cache_dir().join("notes.txt").exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        cache.set(&entry("api", Duration::from_secs(60))).unwrap();
        cache.clear("api").unwrap();
        cache.clear("api").unwrap();

        assert!(cache.get("api").is_none());
    }

    #[test]
    fn test_invalid_key_rejected_on_write() {
        let root = TempDir::new().unwrap();
        let cache = FileCache::registry(root.path()).unwrap();

        let result = cache.set(&entry("../escape", Duration::from_secs(60)));
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
        assert!(cache.get("../escape").is_none());
    }
}
