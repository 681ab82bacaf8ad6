//! Build configuration.
//!
//! Loaded from YAML (`build.yaml` by default). Every field is optional in the
//! file; missing fields take the defaults below. Durations are whole seconds.

use crate::builder::{
    ImageNaming, PushConfig, ResourceThresholds, SchedulerConfig, ADMISSION_BACKOFF,
    DEFAULT_MONITOR_INTERVAL,
};
use crate::cache::{CacheLevel, DEFAULT_CACHE_TTL};
use crate::discovery::{DiscoverySources, ServiceSpec};
use crate::error::{Result, StevedoreError};
use crate::git::MIN_DEPTH;
use crate::smart::SmartConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable forcing registry naming on or off.
pub const USE_REGISTRY_ENV: &str = "STEVEDORE_USE_REGISTRY";

/// Environment variable forcing pushes on or off.
pub const PUSH_ENV: &str = "STEVEDORE_PUSH";

/// Persistent build settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Directories scanned for Dockerfiles. A single string is accepted.
    #[serde(deserialize_with = "one_or_many")]
    pub services_dir: Vec<PathBuf>,
    pub project: String,
    #[serde(alias = "gar")]
    pub registry: String,
    pub region: String,
    pub global_tag: Option<String>,
    pub max_processes: usize,

    #[serde(alias = "use_gar")]
    pub use_registry: bool,
    #[serde(alias = "push_to_gar")]
    pub push: bool,
    pub services: Vec<ServiceSpec>,

    // Smart orchestration
    pub smart: bool,
    pub git_track: bool,
    pub git_track_depth: u32,
    pub cache: bool,
    pub cache_level: CacheLevel,
    pub cache_ttl_secs: u64,
    pub force: bool,
    pub input_changed_services: Option<PathBuf>,
    pub output_changed_services: Option<PathBuf>,

    // Pushes
    pub max_concurrent_pushes: usize,
    pub push_max_retries: u32,
    pub push_retry_delay_secs: u64,

    // Resource-aware scheduling
    #[serde(alias = "enable_resource_monitoring")]
    pub resource_aware: bool,
    pub max_cpu_threshold: f64,
    pub max_memory_threshold: f64,
    pub max_disk_threshold: f64,
    pub monitor_interval_secs: u64,
    pub admission_timeout_secs: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let thresholds = ResourceThresholds::default();
        let push = PushConfig::default();
        Self {
            services_dir: Vec::new(),
            project: String::new(),
            registry: String::new(),
            region: String::new(),
            global_tag: None,
            max_processes: SchedulerConfig::default().max_processes,
            use_registry: false,
            push: false,
            services: Vec::new(),
            smart: false,
            git_track: false,
            git_track_depth: MIN_DEPTH,
            cache: false,
            cache_level: CacheLevel::default(),
            cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            force: false,
            input_changed_services: None,
            output_changed_services: None,
            max_concurrent_pushes: push.max_concurrent,
            push_max_retries: push.max_retries,
            push_retry_delay_secs: push.retry_delay.as_secs(),
            resource_aware: false,
            max_cpu_threshold: thresholds.cpu_percent,
            max_memory_threshold: thresholds.memory_percent,
            max_disk_threshold: thresholds.disk_percent,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL.as_secs(),
            admission_timeout_secs: None,
        }
    }
}

impl BuildConfig {
    /// Load and validate the config at `path`, applying environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StevedoreError::ConfigNotFound { path: path.to_path_buf() });
        }
        let content = std::fs::read_to_string(path).map_err(|e| StevedoreError::io(path, e))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        debug!(path = %path.display(), "Loaded build config");
        Ok(config)
    }

    /// Parse YAML and fill zero-valued limits with their defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(content).map_err(|e| {
            StevedoreError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.max_processes == 0 {
            self.max_processes = defaults.max_processes;
        }
        if self.max_concurrent_pushes == 0 {
            self.max_concurrent_pushes = defaults.max_concurrent_pushes;
        }
        if self.push_max_retries == 0 {
            self.push_max_retries = defaults.push_max_retries;
        }
        if self.monitor_interval_secs == 0 {
            self.monitor_interval_secs = defaults.monitor_interval_secs;
        }
    }

    /// Apply boolean overrides for registry naming and pushing. Unparsable
    /// values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(USE_REGISTRY_ENV).as_deref().and_then(parse_bool) {
            self.use_registry = value;
        }
        if let Some(value) = lookup(PUSH_ENV).as_deref().and_then(parse_bool) {
            self.push = value;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |reason: String| -> Result<()> { Err(StevedoreError::InvalidConfig { reason }) };

        if self.max_processes == 0 {
            return invalid("max_processes must be at least 1".to_string());
        }
        if self.use_registry {
            let missing: Vec<&str> = [
                ("project", &self.project),
                ("registry", &self.registry),
                ("region", &self.region),
            ]
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect();
            if !missing.is_empty() {
                return invalid(format!("registry naming requires {}", missing.join(", ")));
            }
        }
        if self.push && !self.use_registry {
            return invalid("push requires use_registry".to_string());
        }
        for (name, file) in [
            ("input_changed_services", &self.input_changed_services),
            ("output_changed_services", &self.output_changed_services),
        ] {
            if let Some(file) = file {
                if file.extension().and_then(|e| e.to_str()) != Some("txt") {
                    return invalid(format!("{} must be a .txt file, got {}", name, file.display()));
                }
            }
        }
        for (name, value) in [
            ("max_cpu_threshold", self.max_cpu_threshold),
            ("max_memory_threshold", self.max_memory_threshold),
            ("max_disk_threshold", self.max_disk_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return invalid(format!("{} must be in (0, 100], got {}", name, value));
            }
        }
        Ok(())
    }

    pub fn smart_config(&self) -> SmartConfig {
        SmartConfig {
            enabled: self.smart,
            git_tracking: self.git_track,
            git_track_depth: self.git_track_depth,
            cache_enabled: self.cache,
            cache_level: self.cache_level,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            force_rebuild: self.force,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_processes: self.max_processes,
            admission_timeout: self.admission_timeout_secs.map(Duration::from_secs),
            admission_backoff: ADMISSION_BACKOFF,
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            max_concurrent: self.max_concurrent_pushes,
            max_retries: self.push_max_retries,
            retry_delay: Duration::from_secs(self.push_retry_delay_secs),
        }
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            cpu_percent: self.max_cpu_threshold,
            memory_percent: self.max_memory_threshold,
            disk_percent: self.max_disk_threshold,
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// How image references are formed.
    pub fn naming(&self) -> ImageNaming {
        if !self.use_registry {
            return ImageNaming::Local;
        }
        ImageNaming::Registry {
            region: self.region.clone(),
            project: self.project.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn discovery_sources(&self) -> DiscoverySources {
        DiscoverySources {
            services: self.services.clone(),
            services_dirs: self.services_dir.clone(),
            input_file: self.input_changed_services.clone(),
        }
    }

    /// A commented sample config.
    pub fn sample_yaml() -> &'static str {
        SAMPLE_CONFIG
    }

    /// Write [`Self::sample_yaml`] to `path`. Refuses to replace an existing
    /// file unless `overwrite` is set.
    pub fn save_sample(path: &Path, overwrite: bool) -> Result<()> {
        if path.exists() && !overwrite {
            return Err(StevedoreError::InvalidConfig {
                reason: format!("{} already exists", path.display()),
            });
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StevedoreError::io(parent, e))?;
        }
        std::fs::write(path, SAMPLE_CONFIG).map_err(|e| StevedoreError::io(path, e))?;
        info!(path = %path.display(), "Wrote sample config");
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<PathBuf>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(path)) => vec![path],
        Some(OneOrMany::Many(paths)) => paths,
    })
}

const SAMPLE_CONFIG: &str = r#"# stevedore build configuration

# Directories scanned for services (any directory holding a Dockerfile).
services_dir:
  - ./services

# Explicit services. `name` is the service directory.
services:
  - name: services/service-a
    image_name: service-a-image
    tag: v1.0.1
  - name: services/service-b

# Image tag when a service does not set one. Defaults to the short git commit.
global_tag: v1.0.0

# Parallel builds.
max_processes: 4

# Registry naming: {region}-docker.pkg.dev/{project}/{registry}/{image}:{tag}
use_registry: false
push: false
project: my-gcp-project
registry: my-artifact-registry
region: us-central1

# Smart orchestration: build only services git reports as changed.
smart: true
git_track: true
git_track_depth: 2
cache: true
cache_level: distributed
cache_ttl_secs: 86400
force: false
# input_changed_services: changed.txt
# output_changed_services: built.txt

# Pushes
max_concurrent_pushes: 2
push_max_retries: 3
push_retry_delay_secs: 5

# Resource-aware scheduling
resource_aware: false
max_cpu_threshold: 80
max_memory_threshold: 85
max_disk_threshold: 90
monitor_interval_secs: 2
# admission_timeout_secs: 600
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::from_yaml("{}").unwrap();

        assert_eq!(config.max_processes, 4);
        assert_eq!(config.max_concurrent_pushes, 2);
        assert_eq!(config.git_track_depth, 2);
        assert_eq!(config.cache_level, CacheLevel::Distributed);
        assert_eq!(config.smart_config().cache_ttl, Duration::from_secs(86400));
        assert_eq!(config.scheduler_config().admission_timeout, None);
        assert_eq!(config.push_config().retry_delay, Duration::from_secs(5));
        assert_eq!(config.thresholds(), ResourceThresholds::default());
        assert_eq!(config.naming(), ImageNaming::Local);
    }

    #[test]
    fn test_zero_limits_take_defaults() {
        let yaml = "max_processes: 0\nmax_concurrent_pushes: 0\n";
        let config = BuildConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max_processes, 4);
        assert_eq!(config.max_concurrent_pushes, 2);
    }

    #[test]
    fn test_services_dir_accepts_string_or_list() {
        let one = BuildConfig::from_yaml("services_dir: ./services\n").unwrap();
        assert_eq!(one.services_dir, vec![PathBuf::from("./services")]);

        let many = BuildConfig::from_yaml("services_dir: [a, b]\n").unwrap();
        assert_eq!(many.services_dir, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn test_legacy_field_names() {
        let config = BuildConfig::from_yaml(
            "use_gar: true\npush_to_gar: true\ngar: repo\nproject: p\nregion: eu\n",
        )
        .unwrap();

        assert!(config.use_registry && config.push);
        assert_eq!(config.naming().reference("api", "v1"), "eu-docker.pkg.dev/p/repo/api:v1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_requires_coordinates() {
        let config = BuildConfig::from_yaml("use_registry: true\nproject: p\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("registry, region"), "{}", err);
    }

    #[test]
    fn test_changed_services_files_must_be_txt() {
        let config = BuildConfig::from_yaml("output_changed_services: out.json\n").unwrap();
        assert!(config.validate().is_err());

        let config = BuildConfig::from_yaml("input_changed_services: in.txt\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_range() {
        let config = BuildConfig::from_yaml("max_cpu_threshold: 120\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = BuildConfig::default();
        config.apply_overrides(|key| match key {
            USE_REGISTRY_ENV => Some("TRUE".to_string()),
            PUSH_ENV => Some("maybe".to_string()),
            _ => None,
        });

        assert!(config.use_registry);
        assert!(!config.push);
    }

    #[test]
    fn test_sample_parses_and_validates() {
        let config = BuildConfig::from_yaml(BuildConfig::sample_yaml()).unwrap();

        assert!(config.validate().is_ok());
        assert!(config.smart && config.git_track && config.cache);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[1].image_name, None);
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = BuildConfig::load(&tmp.path().join("build.yaml")).unwrap_err();
        assert!(matches!(err, StevedoreError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.yaml");
        std::fs::write(&path, "max_processes: [nope\n").unwrap();

        assert!(matches!(BuildConfig::load(&path), Err(StevedoreError::InvalidConfig { .. })));
    }

    #[test]
    fn test_save_sample_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("build.yaml");

        BuildConfig::save_sample(&path, false).unwrap();
        assert!(BuildConfig::save_sample(&path, false).is_err());
        assert!(BuildConfig::save_sample(&path, true).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BuildConfig::sample_yaml());
    }
}
