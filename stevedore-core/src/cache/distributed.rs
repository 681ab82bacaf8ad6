//! Two-tier cache: process memory in front of a durable store.
//!
//! The memory tier starts empty and is filled by writes and by file-tier
//! hits (write-through on read). Only the file tier survives the process.

use super::{CacheEntry, CacheError, CacheStore, FileCache};
use crate::observability::metrics::record_cache_lookup;
use crate::paths;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// Memory-backed cache layered over another [`CacheStore`].
pub struct DistributedCache<S: CacheStore = FileCache> {
    memory: RwLock<HashMap<String, CacheEntry>>,
    store: S,
}

impl DistributedCache<FileCache> {
    /// Opens the distributed cache with its file tier under `root`.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let store =
            FileCache::with_layout(
                paths::backend_dir(root, "distributed"),
                ".json",
                "distributed",
            )?;
        Ok(Self::with_store(store))
    }
}

impl<S: CacheStore> DistributedCache<S> {
    /// Wraps an existing store with an empty memory tier.
    pub fn with_store(store: S) -> Self {
        Self { memory: RwLock::new(HashMap::new()), store }
    }

    /// The durable tier.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of entries currently held in memory.
    pub fn memory_entries(&self) -> usize {
        self.memory.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<S: CacheStore> CacheStore for DistributedCache<S> {
    fn backend(&self) -> &'static str {
        "distributed"
    }

    fn get(&self, service_name: &str) -> Option<CacheEntry> {
        let cached = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_name)
            .cloned();

        if let Some(entry) = cached {
            if entry.is_expired() {
                debug!(service = service_name, "Memory tier entry expired");
                if let Err(e) = self.clear(service_name) {
                    warn!(service = service_name, error = %e, "Failed to evict expired entry");
                }
                record_cache_lookup("memory", false);
                return None;
            }
            record_cache_lookup("memory", true);
            debug!(service = service_name, "Memory tier hit");
            return Some(entry);
        }

        let entry = self.store.get(service_name)?;
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service_name.to_string(), entry.clone());
        debug!(service = service_name, "File tier hit, promoted to memory");
        Some(entry)
    }

    fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.store.set(entry)?;
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.service_name.clone(), entry.clone());
        Ok(())
    }

    fn clear(&self, service_name: &str) -> Result<(), CacheError> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner).remove(service_name);
        self.store.clear(service_name)
    }

    fn cleanup(&self) -> Result<(), CacheError> {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, entry| !entry.is_expired());
        self.store.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// File store wrapper that counts reads reaching the file tier.
    struct CountingStore {
        inner: FileCache,
        gets: AtomicUsize,
    }

    impl CacheStore for CountingStore {
        fn backend(&self) -> &'static str {
            "counting"
        }
        fn get(&self, service_name: &str) -> Option<CacheEntry> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(service_name)
        }
        fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
            self.inner.set(entry)
        }
        fn clear(&self, service_name: &str) -> Result<(), CacheError> {
            self.inner.clear(service_name)
        }
        fn cleanup(&self) -> Result<(), CacheError> {
            self.inner.cleanup()
        }
    }

    fn counting(root: &Path) -> DistributedCache<CountingStore> {
        let inner = FileCache::registry(root).unwrap();
        DistributedCache::with_store(CountingStore { inner, gets: AtomicUsize::new(0) })
    }

    #[test]
    fn test_file_hit_populates_memory() {
        let root = TempDir::new().unwrap();
        let entry = CacheEntry::new("api", "abc", Duration::from_secs(600));
        FileCache::registry(root.path()).unwrap().set(&entry).unwrap();

        // Fresh process: memory tier is empty.
        let cache = counting(root.path());
        assert_eq!(cache.memory_entries(), 0);

        assert_eq!(cache.get("api"), Some(entry.clone()));
        assert_eq!(cache.store().gets.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get("api"), Some(entry));
        assert_eq!(
            cache.store().gets.load(Ordering::SeqCst),
            1,
            "second read must not touch files"
        );
        assert_eq!(cache.memory_entries(), 1);
    }

    #[test]
    fn test_miss_falls_through() {
        let root = TempDir::new().unwrap();
        let cache = counting(root.path());

        assert!(cache.get("ghost").is_none());
        assert!(cache.get("ghost").is_none());
        assert_eq!(cache.store().gets.load(Ordering::SeqCst), 2);
        assert_eq!(cache.memory_entries(), 0);
    }

    #[test]
    fn test_set_writes_both_tiers() {
        let root = TempDir::new().unwrap();
        let cache = DistributedCache::open(root.path()).unwrap();
        let entry = CacheEntry::new("api", "abc", Duration::from_secs(600));

        cache.set(&entry).unwrap();

        assert_eq!(cache.memory_entries(), 1);
        assert_eq!(cache.store().get("api"), Some(entry));
    }

    #[test]
    fn test_expired_memory_entry_clears_both_tiers() {
        let root = TempDir::new().unwrap();
        let cache = DistributedCache::open(root.path()).unwrap();
        let mut entry = CacheEntry::new("api", "abc", Duration::from_secs(60));
        entry.timestamp -= chrono::Duration::seconds(120);

        // Bypass the expiry check on the file side by seeding memory directly.
        cache.memory.write().unwrap().insert("api".to_string(), entry.clone());
        cache.store().set(&entry).unwrap();

        assert!(cache.get("api").is_none());
        assert_eq!(cache.memory_entries(), 0);
        assert!(!cache.store().cache_dir().join("api.json").exists());
    }

    #[test]
    fn test_cleanup_drops_expired_memory_entries() {
        let root = TempDir::new().unwrap();
        let cache = DistributedCache::open(root.path()).unwrap();
        let mut stale = CacheEntry::new("old", "abc", Duration::from_secs(60));
        stale.timestamp -= chrono::Duration::seconds(120);
        cache.memory.write().unwrap().insert("old".to_string(), stale);
        cache.set(&CacheEntry::new("fresh", "def", Duration::from_secs(60))).unwrap();

        cache.cleanup().unwrap();

        assert_eq!(cache.memory_entries(), 1);
        assert!(cache.get("fresh").is_some());
    }
}
