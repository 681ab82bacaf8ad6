//! Docker CLI primitives.

use super::{BuildError, BuildTask, ImageBuilder, ImagePusher};
use crate::smart::RegistryLookup;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Lines of failure output kept in a [`BuildError::CommandFailed`].
const OUTPUT_TAIL_LINES: usize = 40;

/// Builds, pushes and inspects images by shelling out to `docker`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self { program: "docker".to_string() }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable, e.g. `podman`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, BuildError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, args = ?args, "Running container CLI");
        let output = cmd
            .output()
            .map_err(|source| BuildError::Spawn { program: self.program.clone(), source })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(BuildError::CommandFailed {
                program: format!("{} {}", self.program, args.first().copied().unwrap_or_default()),
                code: output.status.code(),
                output: tail(detail, OUTPUT_TAIL_LINES),
            });
        }

        Ok(format!("{}{}", stdout, stderr))
    }
}

impl ImageBuilder for DockerCli {
    fn build(&self, task: &BuildTask) -> Result<String, BuildError> {
        let image = task.image_reference();
        info!(service = %task.service_path.display(), image = %image, "Building image");
        self.run(Some(&task.service_path), &["build", "-t", &image, "."])
    }
}

impl ImagePusher for DockerCli {
    fn push(&self, image: &str) -> Result<String, BuildError> {
        self.run(None, &["push", image])
    }
}

impl RegistryLookup for DockerCli {
    fn image_exists(&self, image: &str) -> Result<bool, BuildError> {
        match self.run(None, &["manifest", "inspect", image]) {
            Ok(_) => Ok(true),
            Err(BuildError::CommandFailed { output, .. })
                if output.contains("manifest unknown") || output.contains("no such manifest") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
