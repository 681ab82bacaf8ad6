//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Build metrics
    describe_counter!("stevedore_builds_total", "Build tasks finished (by status)");
    describe_histogram!(
        "stevedore_build_duration_seconds",
        "Wall-clock duration of one image build"
    );
    describe_counter!(
        "stevedore_admission_waits_total",
        "Times a worker backed off because host resources were over threshold"
    );

    // Push metrics
    describe_counter!("stevedore_push_attempts_total", "Image push attempts (by status)");

    // Cache metrics
    describe_counter!("stevedore_cache_lookups_total", "Cache lookups (by backend, result)");

    // Git metrics
    describe_counter!(
        "stevedore_git_invocations_total",
        "git subprocess invocations (by kind: status, diff, root)"
    );
}

/// Helper functions for common metric patterns
pub fn record_build(status: &str, duration_secs: f64) {
    counter!("stevedore_builds_total", "status" => status.to_string()).increment(1);
    if status != "skipped" {
        histogram!("stevedore_build_duration_seconds").record(duration_secs);
    }
}

pub fn record_admission_wait() {
    counter!("stevedore_admission_waits_total").increment(1);
}

pub fn record_push_attempt(status: &str) {
    counter!("stevedore_push_attempts_total", "status" => status.to_string()).increment(1);
}

pub fn record_cache_lookup(backend: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("stevedore_cache_lookups_total", "backend" => backend, "result" => result)
        .increment(1);
}

pub fn record_git_invocation(kind: &'static str) {
    counter!("stevedore_git_invocations_total", "kind" => kind).increment(1);
}
