//! Build fingerprint cache.
//!
//! A cache entry records the fingerprint of the last successful build of a
//! service. Entries carry their own TTL and are evicted lazily: an expired
//! entry is deleted the moment a lookup sees it, and `cleanup` simply runs
//! that same lookup over every stored entry.
//!
//! Three backends share the [`CacheStore`] contract:
//!
//! - [`CacheLevel::Registry`]: one JSON document per service.
//! - [`CacheLevel::Layer`]: same layout in its own directory with a
//!   `-layer.json` suffix, for per-layer fingerprints.
//! - [`CacheLevel::Distributed`]: a process-local memory tier in front of a
//!   JSON file tier.

mod distributed;
mod file;
pub mod fingerprint;

pub use distributed::DistributedCache;
pub use file::FileCache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A cached build fingerprint for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub service_name: String,
    pub image_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_tag: Option<String>,
    /// When the entry was written (RFC 3339 on disk).
    pub timestamp: DateTime<Utc>,
    /// Validity window, stored as integer nanoseconds.
    #[serde(with = "ttl_nanos")]
    pub ttl: Duration,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        service_name: impl Into<String>,
        image_hash: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            image_hash: image_hash.into(),
            layer_hash: None,
            registry_tag: None,
            timestamp: Utc::now(),
            ttl,
        }
    }

    /// Age of the entry at `now`. Entries stamped in the future have zero age.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// True once `now - timestamp > ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

mod ttl_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),
}

/// Capability shared by every cache backend.
///
/// `get` never fails: a missing, unreadable, corrupt or expired record is a
/// miss. Writes and removals report their errors.
pub trait CacheStore: Send + Sync {
    /// Short backend label used in logs and metrics.
    fn backend(&self) -> &'static str;

    fn get(&self, service_name: &str) -> Option<CacheEntry>;

    fn set(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Remove one entry. Removing an absent entry succeeds.
    fn clear(&self, service_name: &str) -> Result<(), CacheError>;

    /// Evict every entry a lookup would report as a miss.
    fn cleanup(&self) -> Result<(), CacheError>;
}

/// Cache backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    Layer,
    Registry,
    #[default]
    Distributed,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 3] = [Self::Layer, Self::Registry, Self::Distributed];

    /// Parse level from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "layer" => Some(Self::Layer),
            "registry" => Some(Self::Registry),
            "distributed" => Some(Self::Distributed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::Registry => "registry",
            Self::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Open the backend selected by `level` under `root`.
pub fn open_store(level: CacheLevel, root: &Path) -> Result<Arc<dyn CacheStore>, CacheError> {
    let store: Arc<dyn CacheStore> = match level {
        CacheLevel::Layer => Arc::new(FileCache::layer(root)?),
        CacheLevel::Registry => Arc::new(FileCache::registry(root)?),
        CacheLevel::Distributed => Arc::new(DistributedCache::open(root)?),
    };
    tracing::debug!(backend = store.backend(), root = %root.display(), "Opened cache store");
    Ok(store)
}

/// Reject names that would escape the cache directory.
pub(crate) fn validate_key(service_name: &str) -> Result<(), CacheError> {
    let invalid = service_name.is_empty()
        || service_name == "."
        || service_name == ".."
        || service_name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CacheError::InvalidKey(service_name.to_string()));
    }
    Ok(())
}
