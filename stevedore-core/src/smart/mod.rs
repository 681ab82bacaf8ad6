//! Smart build orchestration.
//!
//! Decides per service whether to build, using git as the authority. The
//! fingerprint cache and registry checks only annotate [`ServiceState`]; they
//! never turn a build into a skip.

mod orchestrator;

pub use orchestrator::SmartOrchestrator;

use crate::builder::BuildError;
use crate::cache::{CacheLevel, DEFAULT_CACHE_TTL};
use crate::git::MIN_DEPTH;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of orchestration for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildDecision {
    SkipBuild,
    ForceBuild,
    ConditionalBuild,
}

impl BuildDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipBuild => "SKIP_BUILD",
            Self::ForceBuild => "FORCE_BUILD",
            Self::ConditionalBuild => "CONDITIONAL_BUILD",
        }
    }

    pub fn needs_build(&self) -> bool {
        !matches!(self, Self::SkipBuild)
    }
}

impl std::fmt::Display for BuildDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Orchestrator switches.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartConfig {
    /// When false every service is force-built.
    pub enabled: bool,
    pub git_tracking: bool,
    pub git_track_depth: u32,
    pub cache_enabled: bool,
    pub cache_level: CacheLevel,
    pub cache_ttl: Duration,
    pub force_rebuild: bool,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            git_tracking: false,
            git_track_depth: MIN_DEPTH,
            cache_enabled: false,
            cache_level: CacheLevel::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            force_rebuild: false,
        }
    }
}

/// What is known about a service's image in the remote registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryState {
    pub configured: bool,
    pub reachable: bool,
    pub image_exists: bool,
}

/// Answers whether an image reference exists in its registry.
pub trait RegistryLookup: Send + Sync + 'static {
    /// `Ok(false)` means the registry answered and has no such image.
    fn image_exists(&self, image: &str) -> Result<bool, BuildError>;
}

/// Per-service orchestration output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ServiceState {
    pub service_name: String,
    pub service_path: PathBuf,
    pub current_hash: Option<String>,
    pub last_build_hash: Option<String>,
    pub changed_files: Vec<String>,
    pub last_build_time: Option<DateTime<Utc>>,
    /// The cached fingerprint matches the current one.
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryState>,
}

impl ServiceState {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Default::default() }
    }

    pub fn with_path(mut self, service_path: impl Into<PathBuf>) -> Self {
        self.service_path = service_path.into();
        self
    }
}

/// Decisions and states for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OrchestrationResult {
    pub service_states: Vec<ServiceState>,
    /// One decision per entry of `service_states`, in the same order.
    pub decisions: Vec<BuildDecision>,
    pub total_services: usize,
    pub build_count: usize,
    pub skip_count: usize,
}

impl OrchestrationResult {
    /// Decision for the first service named `service_name`. Services in
    /// different directories may share a name; use [`Self::entries`] to see
    /// all of them.
    pub fn decision(&self, service_name: &str) -> Option<BuildDecision> {
        let index = self.service_states.iter().position(|s| s.service_name == service_name)?;
        self.decisions.get(index).copied()
    }

    /// States paired with their decisions, in orchestration order.
    pub fn entries(&self) -> impl Iterator<Item = (&ServiceState, BuildDecision)> {
        self.service_states.iter().zip(self.decisions.iter().copied())
    }

    pub fn state(&self, service_name: &str) -> Option<&ServiceState> {
        self.service_states.iter().find(|s| s.service_name == service_name)
    }

    pub(crate) fn record(&mut self, state: ServiceState, decision: BuildDecision) {
        if decision.needs_build() {
            self.build_count += 1;
        } else {
            self.skip_count += 1;
        }
        self.decisions.push(decision);
        self.service_states.push(state);
    }

    /// One-line summary for logs and the CLI.
    pub fn stats(&self) -> String {
        format!(
            "Smart orchestration: {} total, {} to build, {} skipped",
            self.total_services, self.build_count, self.skip_count
        )
    }
}
