//! End-to-end build run: orchestrate, schedule, push, record.

use crate::builder::{
    system_info, AdmissionGate, BuildResult, BuildScheduler, BuildStatus, BuildTask, DockerCli,
    ImageBuilder, ImageNaming, ImagePusher, PushManager, ResourceMonitor, Summary,
};
use crate::config::BuildConfig;
use crate::discovery::{write_changed_services, DiscoveryResult, ServiceDescriptor};
use crate::error::{Result, StevedoreError};
use crate::smart::{OrchestrationResult, SmartOrchestrator};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Everything one run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub orchestration: OrchestrationResult,
    pub results: Vec<BuildResult>,
    pub summary: Summary,
}

pub struct BuildPipeline {
    config: BuildConfig,
    orchestrator: SmartOrchestrator,
    builder: Arc<dyn ImageBuilder>,
    pusher: Arc<dyn ImagePusher>,
    gate: Option<Arc<dyn AdmissionGate>>,
}

impl BuildPipeline {
    pub fn new(
        config: BuildConfig,
        orchestrator: SmartOrchestrator,
        builder: Arc<dyn ImageBuilder>,
        pusher: Arc<dyn ImagePusher>,
    ) -> Self {
        Self { config, orchestrator, builder, pusher, gate: None }
    }

    /// Pipeline driving the `docker` CLI and the system `git`.
    pub fn open(config: BuildConfig, cache_root: &Path) -> Result<Self> {
        let docker = Arc::new(DockerCli::new());
        let mut orchestrator = SmartOrchestrator::open(config.smart_config(), cache_root)?;
        if config.smart && config.use_registry {
            orchestrator = orchestrator.with_registry_lookup(docker.clone(), config.naming());
        }
        Ok(Self::new(config, orchestrator, docker.clone(), docker))
    }

    /// Admit builds through `gate` instead of a resource monitor.
    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &SmartOrchestrator {
        &self.orchestrator
    }

    #[instrument(skip_all, fields(services = discovery.services.len()))]
    pub async fn run(&self, discovery: DiscoveryResult) -> Result<PipelineReport> {
        for e in &discovery.errors {
            warn!(error = %e, "Discovery error");
        }
        if discovery.services.is_empty() {
            return Err(StevedoreError::NoServices);
        }

        let orchestration = self.orchestrator.orchestrate_builds(&discovery.services).await;
        let services = apply_decisions(discovery.services, &orchestration);

        if let Some(file) = &self.config.output_changed_services {
            let selected: Vec<_> = services.iter().filter(|s| s.needs_build).cloned().collect();
            write_changed_services(&selected, file)?;
        }

        let naming = self.config.naming();
        let tasks: Vec<BuildTask> = services.iter().map(|s| task(s, &naming)).collect();
        let hashes: HashMap<String, (String, String)> = services
            .iter()
            .filter_map(|s| {
                let hash = s.current_hash.clone()?;
                Some((s.path.display().to_string(), (s.name.clone(), hash)))
            })
            .collect();

        let monitor = if self.config.resource_aware && self.gate.is_none() {
            info!(system = %system_info(), "Resource-aware scheduling enabled");
            let monitor = Arc::new(ResourceMonitor::new(
                self.config.thresholds(),
                self.config.monitor_interval(),
            ));
            monitor.start();
            Some(monitor)
        } else {
            None
        };

        let push_manager = if self.config.push {
            let manager =
                Arc::new(PushManager::new(self.config.push_config(), Arc::clone(&self.pusher)));
            manager.start();
            Some(manager)
        } else {
            None
        };

        let mut scheduler =
            BuildScheduler::new(self.config.scheduler_config(), Arc::clone(&self.builder));
        let gate =
            self.gate.clone().or_else(|| monitor.clone().map(|m| m as Arc<dyn AdmissionGate>));
        if let Some(gate) = gate {
            scheduler = scheduler.with_gate(gate);
        }
        if let Some(manager) = &push_manager {
            scheduler = scheduler.with_push_manager(Arc::clone(manager));
        }

        let outcome = scheduler.run(tasks).await;

        if let Some(manager) = &push_manager {
            manager.stop().await;
        }
        if let Some(monitor) = &monitor {
            monitor.stop().await;
        }
        let (results, summary) = outcome?;

        for result in results.iter().filter(|r| r.status == BuildStatus::Success) {
            let Some((name, hash)) = hashes.get(&result.service) else {
                continue;
            };
            if let Err(e) = self.orchestrator.update_cache(name, hash) {
                warn!(service = %name, error = %e, "Failed to update build cache");
            }
        }

        Ok(PipelineReport { orchestration, results, summary })
    }
}

/// Copy each service's decision and state onto its descriptor. States come
/// back in discovery order, one per service.
fn apply_decisions(
    services: Vec<ServiceDescriptor>,
    orchestration: &OrchestrationResult,
) -> Vec<ServiceDescriptor> {
    services
        .into_iter()
        .zip(orchestration.entries())
        .map(|(mut service, (state, decision))| {
            debug_assert_eq!(service.path, state.service_path);
            service.needs_build = decision.needs_build();
            service.current_hash = state.current_hash.clone();
            service.changed_files = state.changed_files.clone();
            service
        })
        .collect()
}

fn task(service: &ServiceDescriptor, naming: &ImageNaming) -> BuildTask {
    BuildTask {
        service_path: service.path.clone(),
        service_name: service.name.clone(),
        image_name: service.image_name.clone(),
        tag: service.tag.clone(),
        naming: naming.clone(),
        current_hash: service.current_hash.clone(),
        changed_files: service.changed_files.clone(),
        needs_build: service.needs_build,
    }
}
