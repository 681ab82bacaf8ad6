//! Image building: task and result types, the docker primitives, host
//! resource monitoring, the build scheduler and the push manager.
//!
//! The external primitives (`docker build`, `docker push`) are blocking
//! calls behind [`ImageBuilder`] and [`ImagePusher`]. The scheduler and the
//! push manager run them on tokio's blocking pool so that each in-flight
//! build or push occupies exactly one worker for its whole duration.

mod docker;
mod monitor;
mod push;
mod scheduler;

pub use docker::DockerCli;
pub use monitor::{
    system_info, AdmissionGate, HostSampler, ResourceMonitor, ResourceSample, ResourceSampler,
    ResourceThresholds, ResourceUsage, DEFAULT_MONITOR_INTERVAL,
};
pub use push::{
    PushConfig, PushHandle, PushManager, PushResult, PushStats, DEFAULT_MAX_CONCURRENT_PUSHES,
    DEFAULT_PUSH_RETRIES, DEFAULT_PUSH_RETRY_DELAY, PUSH_QUEUE_CAPACITY,
};
pub use scheduler::{BuildScheduler, SchedulerConfig, ADMISSION_BACKOFF};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the build and push primitives.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?}: {output}")]
    CommandFailed { program: String, code: Option<i32>, output: String },

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Push manager is not accepting requests")]
    PushQueueClosed,

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

/// Runs one image build. Blocks for the duration of the build.
pub trait ImageBuilder: Send + Sync + 'static {
    /// Build `task`'s image, returning the captured output on success.
    fn build(&self, task: &BuildTask) -> Result<String, BuildError>;
}

/// Pushes one image reference. Blocks for the duration of the push.
pub trait ImagePusher: Send + Sync + 'static {
    fn push(&self, image: &str) -> Result<String, BuildError>;
}

/// Outcome of one build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failed,
    Skipped,
}

impl BuildStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one push request after all attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Success,
    Failed,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How image references are formed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ImageNaming {
    /// `{image}:{tag}`
    #[default]
    Local,
    /// `{region}-docker.pkg.dev/{project}/{registry}/{image}:{tag}`
    Registry { region: String, project: String, registry: String },
}

impl ImageNaming {
    pub fn reference(&self, image_name: &str, tag: &str) -> String {
        match self {
            Self::Local => format!("{}:{}", image_name, tag),
            Self::Registry { region, project, registry } => format!(
                "{}-docker.pkg.dev/{}/{}/{}:{}",
                region, project, registry, image_name, tag
            ),
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Registry { .. })
    }
}

/// One service admitted for scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub service_path: PathBuf,
    pub service_name: String,
    pub image_name: String,
    pub tag: String,
    pub naming: ImageNaming,
    pub current_hash: Option<String>,
    pub changed_files: Vec<String>,
    /// When false the task is reported as skipped without building.
    pub needs_build: bool,
}

impl BuildTask {
    pub fn image_reference(&self) -> String {
        self.naming.reference(&self.image_name, &self.tag)
    }
}

/// Result of one task. Created once by the scheduler and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
    /// Service path as discovered.
    pub service: String,
    /// Resolved image reference, empty for skipped tasks.
    pub image: String,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BuildResult {
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn push_failed(&self) -> bool {
        self.push.as_ref().is_some_and(|p| p.status == PushStatus::Failed)
    }
}

/// Aggregate counts for one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Summary {
    pub total_services: usize,
    pub successful_builds: usize,
    pub failed_builds: usize,
    pub skipped_builds: usize,
    pub failed_pushes: usize,
    /// Wall clock from scheduler start to the last collected result.
    pub duration: Duration,
}

impl Summary {
    pub fn from_results(results: &[BuildResult], duration: Duration) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        Self {
            total_services: results.len(),
            successful_builds: count(BuildStatus::Success),
            failed_builds: count(BuildStatus::Failed),
            skipped_builds: count(BuildStatus::Skipped),
            failed_pushes: results.iter().filter(|r| r.push_failed()).count(),
            duration,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed_builds > 0 || self.failed_pushes > 0
    }
}
