//! stevedore core library
//!
//! Parallel, change-aware container image builds for repositories holding
//! many services.

pub mod builder;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod git;
pub mod observability;
pub mod paths;
pub mod pipeline;
pub mod smart;

// Re-export commonly used items
pub use builder::{BuildResult, BuildStatus, PushStatus, Summary};
pub use cache::{CacheEntry, CacheLevel, CacheStore};
pub use config::BuildConfig;
pub use discovery::{DiscoveryResult, ServiceDescriptor};
pub use error::{Result, StevedoreError};
pub use git::GitTracker;
pub use observability::init as init_observability;
pub use pipeline::{BuildPipeline, PipelineReport};
pub use smart::{BuildDecision, SmartOrchestrator};
