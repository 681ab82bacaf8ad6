use super::{
    BuildDecision, OrchestrationResult, RegistryLookup, RegistryState, ServiceState, SmartConfig,
};
use crate::builder::ImageNaming;
use crate::cache::{fingerprint, open_store, CacheEntry, CacheError, CacheStore};
use crate::discovery::ServiceDescriptor;
use crate::git::{ChangeDetector, GitTracker};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Per-service build decisions driven by git change detection.
pub struct SmartOrchestrator {
    config: SmartConfig,
    detector: Arc<dyn ChangeDetector>,
    cache: Option<Arc<dyn CacheStore>>,
    registry: Option<(Arc<dyn RegistryLookup>, ImageNaming)>,
}

impl SmartOrchestrator {
    pub fn new(
        config: SmartConfig,
        detector: Arc<dyn ChangeDetector>,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        Self { config, detector, cache, registry: None }
    }

    /// Orchestrator backed by the system `git` and, when caching is enabled,
    /// the configured cache backend under `cache_root`.
    pub fn open(config: SmartConfig, cache_root: &Path) -> Result<Self, CacheError> {
        let cache = if config.enabled && config.cache_enabled {
            Some(open_store(config.cache_level, cache_root)?)
        } else {
            None
        };
        Ok(Self::new(config, Arc::new(GitTracker::new()), cache))
    }

    /// Report registry presence of each service's image in its state.
    pub fn with_registry_lookup(
        mut self,
        lookup: Arc<dyn RegistryLookup>,
        naming: ImageNaming,
    ) -> Self {
        self.registry = Some((lookup, naming));
        self
    }

    pub fn config(&self) -> &SmartConfig {
        &self.config
    }

    /// Decide what to do with every service, in order.
    #[instrument(skip_all, fields(services = services.len()))]
    pub async fn orchestrate_builds(&self, services: &[ServiceDescriptor]) -> OrchestrationResult {
        let mut result =
            OrchestrationResult { total_services: services.len(), ..Default::default() };

        if !self.config.enabled {
            debug!("Smart orchestration disabled, force-building every service");
            for service in services {
                result.record(
                    ServiceState::new(&service.name).with_path(&service.path),
                    BuildDecision::ForceBuild,
                );
            }
            return result;
        }

        for service in services {
            let (state, decision) = self.decide(service).await;
            info!(
                service = %service.name,
                decision = %decision,
                changed_files = state.changed_files.len(),
                cache_hit = state.cache_hit,
                "Build decision"
            );
            result.record(state, decision);
        }

        info!("{}", result.stats());
        result
    }

    /// Decide for one service.
    ///
    /// Only the force flag and git feed the decision. The fingerprint, cache
    /// and registry lookups fill in the returned state.
    #[instrument(skip_all, fields(service = %service.name))]
    pub async fn decide(&self, service: &ServiceDescriptor) -> (ServiceState, BuildDecision) {
        let mut state = ServiceState::new(&service.name).with_path(&service.path);
        state.current_hash = self.fingerprint(&service.path).await;
        self.fill_cache_info(&mut state);
        state.registry = self.registry_state(service).await;

        if self.config.force_rebuild {
            return (state, BuildDecision::ForceBuild);
        }
        if !self.config.git_tracking {
            return (state, BuildDecision::ConditionalBuild);
        }

        match self.detector.changed_files(&service.path, self.config.git_track_depth).await {
            Ok(files) if files.is_empty() => (state, BuildDecision::SkipBuild),
            Ok(files) => {
                state.changed_files = files;
                (state, BuildDecision::ConditionalBuild)
            }
            Err(e) => {
                warn!(error = %e, "Git change detection failed, building anyway");
                (state, BuildDecision::ConditionalBuild)
            }
        }
    }

    /// Record the fingerprint of a successful build. No-op without a cache.
    pub fn update_cache(&self, service_name: &str, image_hash: &str) -> Result<(), CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let entry = CacheEntry::new(service_name, image_hash, self.config.cache_ttl);
        cache.set(&entry)?;
        debug!(service = %service_name, backend = cache.backend(), "Updated build cache");
        Ok(())
    }

    /// Evict expired cache entries.
    pub fn cleanup(&self) -> Result<(), CacheError> {
        match &self.cache {
            Some(cache) => cache.cleanup(),
            None => Ok(()),
        }
    }

    async fn fingerprint(&self, service_path: &Path) -> Option<String> {
        let path = service_path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || fingerprint::service_hash(&path)).await;
        match outcome {
            Ok(Ok(hash)) => Some(hash),
            Ok(Err(e)) => {
                debug!(error = %e, "Could not fingerprint service");
                None
            }
            Err(e) => {
                warn!(error = %e, "Fingerprint task failed");
                None
            }
        }
    }

    fn fill_cache_info(&self, state: &mut ServiceState) {
        let Some(entry) = self.cache.as_ref().and_then(|c| c.get(&state.service_name)) else {
            return;
        };
        if !fingerprint::is_valid_hash(&entry.image_hash) {
            debug!(hash = %entry.image_hash, "Ignoring cache entry with a malformed fingerprint");
            return;
        }
        state.cache_hit = state.current_hash.as_deref() == Some(entry.image_hash.as_str());
        state.last_build_time = Some(entry.timestamp);
        state.last_build_hash = Some(entry.image_hash);
    }

    async fn registry_state(&self, service: &ServiceDescriptor) -> Option<RegistryState> {
        let (lookup, naming) = self.registry.as_ref()?;
        let lookup = Arc::clone(lookup);
        let image = naming.reference(&service.image_name, &service.tag);

        let outcome = tokio::task::spawn_blocking(move || lookup.image_exists(&image)).await;
        let state = match outcome {
            Ok(Ok(exists)) => {
                RegistryState { configured: true, reachable: true, image_exists: exists }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Registry lookup failed");
                RegistryState { configured: true, ..Default::default() }
            }
            Err(e) => {
                warn!(error = %e, "Registry lookup task failed");
                RegistryState { configured: true, ..Default::default() }
            }
        };
        Some(state)
    }
}
