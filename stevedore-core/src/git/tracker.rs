//! Git-backed [`ChangeDetector`].

use super::{effective_depth, ChangeDetector, GitCacheStats, GitError, GitResultCache, SignalKind};
use crate::observability::metrics::record_git_invocation;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Exit code git uses for fatal errors such as an unknown revision.
const GIT_FATAL_EXIT: i32 = 128;

/// Captured result of one git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: Some(0), stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { code: Some(code), stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs git with a working directory and argument list.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError>;
}

/// Runs the `git` binary found on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

#[async_trait]
impl GitRunner for SystemGit {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(GitError::Unavailable)?;

        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Change detector combining `git status` and `git diff`, with a result cache.
pub struct GitTracker<R: GitRunner = SystemGit> {
    runner: R,
    cache: GitResultCache,
}

impl GitTracker<SystemGit> {
    pub fn new() -> Self {
        Self::with_runner(SystemGit)
    }
}

impl Default for GitTracker<SystemGit> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: GitRunner> GitTracker<R> {
    pub fn with_runner(runner: R) -> Self {
        Self::with_cache(runner, GitResultCache::default())
    }

    pub fn with_cache(runner: R, cache: GitResultCache) -> Self {
        Self { runner, cache }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Drop every cached git result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> GitCacheStats {
        self.cache.stats()
    }

    async fn git(
        &self,
        kind: &'static str,
        dir: &Path,
        args: &[&str],
    ) -> Result<GitOutput, GitError> {
        record_git_invocation(kind);
        debug!(dir = %dir.display(), args = ?args, "Running git");
        self.runner.run(dir, args).await
    }

    /// Top-level directory of the repository containing `dir`.
    pub async fn repo_root(&self, dir: &Path) -> Result<PathBuf, GitError> {
        if !dir.is_dir() {
            return Err(GitError::InvalidPath { path: dir.to_path_buf() });
        }

        let output = self.git("root", dir, &["rev-parse", "--show-toplevel"]).await?;
        let root = output.stdout.trim();
        if !output.success() || root.is_empty() {
            return Err(GitError::NotARepository { path: dir.to_path_buf() });
        }
        Ok(PathBuf::from(root))
    }

    /// Commit id of `HEAD`, abbreviated when `short` is set.
    pub async fn head_commit(&self, dir: &Path, short: bool) -> Result<String, GitError> {
        let args: &[&str] =
            if short { &["rev-parse", "--short", "HEAD"] } else { &["rev-parse", "HEAD"] };
        let output = self.git("rev-parse", dir, args).await?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                command: "rev-parse HEAD".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Resolve the repository root and the service's path inside it.
    async fn locate(&self, service_path: &Path) -> Result<(PathBuf, String), GitError> {
        let root = self.repo_root(service_path).await?;
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        let service = std::fs::canonicalize(service_path)
            .map_err(|_| GitError::InvalidPath { path: service_path.to_path_buf() })?;

        let relative = service
            .strip_prefix(&root)
            .map_err(|_| GitError::NotARepository { path: service_path.to_path_buf() })?;
        Ok((root, relative.to_string_lossy().into_owned()))
    }

    /// Uncommitted changes under the service.
    async fn status_files(&self, root: &Path, relative: &str) -> Result<Vec<String>, GitError> {
        let args = ["status", "--porcelain", "-z", "--", pathspec(relative)];
        let output = self.git("status", root, &args).await?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                command: "status".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_status(&output.stdout, relative))
    }

    /// Files touched by the last `depth - 1` commits under the service.
    async fn diff_files(
        &self,
        root: &Path,
        relative: &str,
        depth: u32,
    ) -> Result<Vec<String>, GitError> {
        let base = format!("HEAD~{}", depth - 1);
        let spec = pathspec(relative);

        let output = self
            .git("diff", root, &["diff", "--name-only", "-z", base.as_str(), "HEAD", "--", spec])
            .await?;
        if output.success() {
            return Ok(parse_names(&output.stdout));
        }
        if output.code != Some(GIT_FATAL_EXIT) {
            return Err(GitError::CommandFailed {
                command: format!("diff {}..HEAD", base),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        debug!(base = %base, "History shorter than requested depth, diffing against HEAD");
        let fallback =
            self.git("diff", root, &["diff", "--name-only", "-z", "HEAD", "--", spec]).await?;
        if fallback.success() {
            return Ok(parse_names(&fallback.stdout));
        }

        warn!(
            path = relative,
            stderr = %fallback.stderr.trim(),
            "git diff against HEAD failed, treating as no committed changes"
        );
        Ok(Vec::new())
    }
}

#[async_trait]
impl<R: GitRunner> ChangeDetector for GitTracker<R> {
    #[instrument(skip(self, service_path), fields(path = %service_path.display()))]
    async fn changed_files(
        &self,
        service_path: &Path,
        depth: u32,
    ) -> Result<Vec<String>, GitError> {
        let depth = effective_depth(depth);

        let mut status = self.cache.get(service_path, depth, SignalKind::Status);
        let mut diff = self.cache.get(service_path, depth, SignalKind::Diff);

        if status.is_none() || diff.is_none() {
            let (root, relative) = self.locate(service_path).await?;

            if status.is_none() {
                let files = self.status_files(&root, &relative).await?;
                self.cache.insert(service_path, depth, SignalKind::Status, files.clone());
                status = Some(files);
            }
            if diff.is_none() {
                let files = self.diff_files(&root, &relative, depth).await?;
                self.cache.insert(service_path, depth, SignalKind::Diff, files.clone());
                diff = Some(files);
            }
        }

        let mut seen = HashSet::new();
        let merged: Vec<String> = status
            .into_iter()
            .flatten()
            .chain(diff.into_iter().flatten())
            .filter(|file| seen.insert(file.clone()))
            .collect();

        debug!(depth, changed = merged.len(), "Detected changed files");
        Ok(merged)
    }
}

fn pathspec(relative: &str) -> &str {
    if relative.is_empty() {
        "."
    } else {
        relative
    }
}

/// True when `file` (repository-relative) lies inside `relative`.
fn is_under(file: &str, relative: &str) -> bool {
    relative.is_empty()
        || file == relative
        || file.strip_prefix(relative).is_some_and(|rest| rest.starts_with('/'))
}

/// Parse `git status --porcelain -z` output, keeping paths under `relative`.
///
/// Entries are NUL-terminated and never quoted. A rename or copy entry holds
/// the new path and is followed by a separate field with the source path.
fn parse_status(stdout: &str, relative: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut fields = stdout.split('\0');
    while let Some(entry) = fields.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        if code.chars().any(|c| matches!(c, 'R' | 'C')) {
            fields.next();
        }
        if !path.is_empty() && is_under(path, relative) {
            files.push(path.to_string());
        }
    }
    files
}

/// Parse NUL-separated `git diff --name-only -z` output.
fn parse_names(stdout: &str) -> Vec<String> {
    stdout.split('\0').filter(|name| !name.is_empty()).map(str::to_string).collect()
}
