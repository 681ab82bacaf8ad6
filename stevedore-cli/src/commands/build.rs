//! Build command implementation.
//!
//! Loads `build.yaml`, applies flag overrides, discovers services and runs
//! the build pipeline.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use stevedore_core::builder::{BuildResult, BuildStatus, PushStatus};
use stevedore_core::cache::CacheLevel;
use stevedore_core::discovery::{self, DiscoveryResult};
use stevedore_core::paths;
use stevedore_core::smart::BuildDecision;
use stevedore_core::{BuildConfig, BuildPipeline, GitTracker, PipelineReport};
use std::path::{Path, PathBuf};

/// Flags for `stevedore build`. Each one overrides the config file.
#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Path to the build configuration
    #[arg(short, long, default_value = paths::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Maximum parallel builds
    #[arg(short, long)]
    pub max_processes: Option<usize>,

    /// Registry project
    #[arg(long)]
    pub project: Option<String>,

    /// Registry region, e.g. us-central1
    #[arg(long)]
    pub region: Option<String>,

    /// Registry repository name
    #[arg(long, alias = "gar")]
    pub registry: Option<String>,

    /// Tag applied to every image (defaults to the short git commit)
    #[arg(long)]
    pub global_tag: Option<String>,

    /// Comma-separated directories to scan for services
    #[arg(long, value_delimiter = ',')]
    pub services_dir: Vec<PathBuf>,

    /// File listing the service paths to build, one per line
    #[arg(long)]
    pub input_changed_services: Option<PathBuf>,

    /// File to write the paths of services selected for build
    #[arg(long)]
    pub output_changed_services: Option<PathBuf>,

    /// Use git to detect changed services
    #[arg(long)]
    pub git_track: bool,

    /// Git history depth in commits (minimum 2)
    #[arg(long)]
    pub depth: Option<u32>,

    /// Record build fingerprints in the cache
    #[arg(long)]
    pub cache: bool,

    /// Cache backend
    #[arg(long, value_parser = super::cache_level_parser())]
    pub cache_level: Option<CacheLevel>,

    /// Rebuild every service
    #[arg(long)]
    pub force: bool,

    /// Build only what changed
    #[arg(long)]
    pub smart: bool,

    /// Name images for the remote registry
    #[arg(long, alias = "use-gar")]
    pub use_registry: bool,

    /// Push images after a successful build
    #[arg(long, alias = "push-to-gar")]
    pub push: bool,

    /// Hold builds while CPU, memory or disk is over threshold
    #[arg(long)]
    pub resource_aware: bool,
}

impl BuildArgs {
    /// Fold the flags into `config`. Switches only ever turn features on.
    fn apply(self, config: &mut BuildConfig) {
        if let Some(n) = self.max_processes.filter(|n| *n > 0) {
            config.max_processes = n;
        }
        if let Some(project) = self.project {
            config.project = project;
        }
        if let Some(region) = self.region {
            config.region = region;
        }
        if let Some(registry) = self.registry {
            config.registry = registry;
        }
        if self.global_tag.is_some() {
            config.global_tag = self.global_tag;
        }
        if !self.services_dir.is_empty() {
            config.services_dir = self.services_dir;
        }
        if self.input_changed_services.is_some() {
            config.input_changed_services = self.input_changed_services;
        }
        if self.output_changed_services.is_some() {
            config.output_changed_services = self.output_changed_services;
        }
        if let Some(depth) = self.depth {
            config.git_track_depth = depth;
        }
        if let Some(level) = self.cache_level {
            config.cache_level = level;
        }
        config.git_track |= self.git_track;
        config.cache |= self.cache;
        config.force |= self.force;
        config.smart |= self.smart;
        config.use_registry |= self.use_registry;
        config.push |= self.push;
        config.resource_aware |= self.resource_aware;
    }
}

/// Run a build. Returns false when any build failed.
pub async fn build(args: BuildArgs) -> Result<bool> {
    let mut config = BuildConfig::load(&args.config).with_context(|| {
        format!("Failed to load {} (create one with `stevedore init`)", args.config.display())
    })?;
    args.apply(&mut config);
    config.validate().context("Invalid build configuration")?;

    let root = Path::new(".");
    let tag = match config.global_tag.clone().filter(|t| !t.is_empty()) {
        Some(tag) => tag,
        None => discovery::default_tag(&GitTracker::new(), root).await,
    };

    println!("{} Discovering services", "[1/3]".bold().blue());
    let found = discovery::discover(&config.discovery_sources(), root, &tag);
    print_discovery(&found);

    if config.smart {
        println!(
            "{} Smart orchestration (git: {}, depth: {}, cache: {}, force: {})",
            "[2/3]".bold().blue(),
            config.git_track,
            config.git_track_depth,
            config.cache,
            config.force
        );
    } else {
        println!("{} Smart orchestration disabled, building every service", "[2/3]".bold().blue());
    }

    let max_processes = config.max_processes;
    let pipeline = BuildPipeline::open(config, &paths::cache_root())
        .context("Failed to set up build pipeline")?;

    println!("{} Building with up to {} parallel builds", "[3/3]".bold().blue(), max_processes);
    let report = pipeline.run(found).await.context("Build failed")?;

    print_report(&report, pipeline.config().smart);
    Ok(report.summary.failed_builds == 0)
}

fn print_discovery(found: &DiscoveryResult) {
    println!("  {} services found", found.services.len().to_string().yellow());
    for service in &found.services {
        println!("    {} ({})", service.name.green(), service.path.display());
    }
    for error in &found.errors {
        println!("  {} {}", "warning:".yellow(), error);
    }
}

fn print_report(report: &PipelineReport, smart: bool) {
    if smart {
        println!();
        println!("{}", report.orchestration.stats().bold());
        for (state, decision) in report.orchestration.entries() {
            let label = match decision {
                BuildDecision::SkipBuild => "SKIP (no changes)".dimmed(),
                BuildDecision::ForceBuild => "FORCE_BUILD".yellow(),
                BuildDecision::ConditionalBuild => "BUILD (changes detected)".green(),
            };
            println!("  {:<24} {}", state.service_path.display(), label);
        }
    }

    println!();
    for result in &report.results {
        print_result(result);
    }

    let summary = &report.summary;
    println!();
    println!("{}", "Build summary".bold());
    println!("  Total services:    {}", summary.total_services);
    println!("  Successful builds: {}", summary.successful_builds.to_string().green());
    println!("  Failed builds:     {}", colored_count(summary.failed_builds));
    println!("  Skipped builds:    {}", summary.skipped_builds.to_string().dimmed());
    if summary.failed_pushes > 0 {
        println!("  Failed pushes:     {}", colored_count(summary.failed_pushes));
    }
    println!("  Duration:          {:.1}s", summary.duration.as_secs_f64());
}

fn print_result(result: &BuildResult) {
    let status = match result.status {
        BuildStatus::Success => "✓".green(),
        BuildStatus::Failed => "✗".red(),
        BuildStatus::Skipped => "-".dimmed(),
    };
    let duration = result.duration().as_secs_f64();

    if result.status == BuildStatus::Skipped {
        println!("{} {}", status, result.service.dimmed());
        return;
    }
    println!("{} {} {} ({:.1}s)", status, result.service, result.image.cyan(), duration);

    if let Some(push) = &result.push {
        match push.status {
            PushStatus::Success => {
                println!("    pushed after {} attempt(s)", push.retry_count);
            }
            PushStatus::Failed => {
                println!("    {} after {} attempt(s)", "push failed".red(), push.retry_count);
                print_output(&push.output);
            }
        }
    }
    if result.status == BuildStatus::Failed {
        if let Some(output) = &result.build_output {
            print_output(output);
        }
    }
}

fn print_output(output: &str) {
    for line in output.trim_end().lines() {
        println!("    {}", line.dimmed());
    }
}

fn colored_count(n: usize) -> colored::ColoredString {
    if n > 0 {
        n.to_string().red()
    } else {
        n.to_string().normal()
    }
}
