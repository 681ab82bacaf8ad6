//! Service discovery.
//!
//! A service is a directory containing a `Dockerfile`. Services come from
//! up to three sources:
//!
//! - an explicit list in the build config
//! - a recursive scan of configured directories
//! - a newline-separated input file of service paths
//!
//! With no source configured the project root is scanned. Results from every
//! source are merged by path, first seen wins. Problems with individual
//! services are collected, never fatal.

use crate::error::StevedoreError;
use crate::git::{GitRunner, GitTracker};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Tag used when neither the config nor git provides one.
pub const FALLBACK_TAG: &str = "latest";

/// Directory names never descended into while scanning.
const EXCLUDED_DIRS: &[&str] = &[
    "debian",
    "build",
    "dist",
    "target",
    "node_modules",
    "vendor",
    "__pycache__",
];

/// A service entry in the build config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Path of the service directory.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A buildable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub path: PathBuf,
    /// Final path component of `path`.
    pub name: String,
    pub image_name: String,
    pub tag: String,
    pub current_hash: Option<String>,
    pub changed_files: Vec<String>,
    pub needs_build: bool,
}

impl ServiceDescriptor {
    pub fn new(
        path: impl Into<PathBuf>,
        image_name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        let path = clean(&path.into());
        let name = service_name(&path);
        Self {
            path,
            name,
            image_name: image_name.into(),
            tag: tag.into(),
            current_hash: None,
            changed_files: Vec::new(),
            needs_build: true,
        }
    }
}

/// Where to look for services.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySources {
    pub services: Vec<ServiceSpec>,
    pub services_dirs: Vec<PathBuf>,
    pub input_file: Option<PathBuf>,
}

impl DiscoverySources {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.services_dirs.is_empty() && self.input_file.is_none()
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryResult {
    pub services: Vec<ServiceDescriptor>,
    pub errors: Vec<StevedoreError>,
}

impl DiscoveryResult {
    fn extend(&mut self, other: DiscoveryResult) {
        self.services.extend(other.services);
        self.errors.extend(other.errors);
    }
}

/// Discover services from `sources`. Relative paths resolve against `root`.
pub fn discover(sources: &DiscoverySources, root: &Path, default_tag: &str) -> DiscoveryResult {
    debug!(
        explicit = sources.services.len(),
        dirs = sources.services_dirs.len(),
        input_file = sources.input_file.is_some(),
        "Discovering services"
    );

    let mut result = DiscoveryResult::default();
    if sources.is_empty() {
        debug!(root = %root.display(), "No discovery sources configured, scanning project root");
        result.extend(scan_dir(root, default_tag));
    }
    if !sources.services.is_empty() {
        result.extend(from_specs(&sources.services, root, default_tag));
    }
    for dir in &sources.services_dirs {
        result.extend(scan_dir(&resolve(root, dir), default_tag));
    }
    if let Some(file) = &sources.input_file {
        result.extend(from_input_file(&resolve(root, file), root, default_tag));
    }

    let before = result.services.len();
    result.services = merge_sources(result.services);
    if result.services.len() < before {
        debug!(dropped = before - result.services.len(), "Dropped duplicate services");
    }

    info!(
        services = result.services.len(),
        errors = result.errors.len(),
        "Service discovery complete"
    );
    result
}

/// Short HEAD commit id of the repository at `root`, or [`FALLBACK_TAG`].
pub async fn default_tag<R: GitRunner>(git: &GitTracker<R>, root: &Path) -> String {
    match git.head_commit(root, true).await {
        Ok(commit) if !commit.is_empty() => commit,
        Ok(_) => FALLBACK_TAG.to_string(),
        Err(e) => {
            debug!(error = %e, "No git commit for default tag, using {}", FALLBACK_TAG);
            FALLBACK_TAG.to_string()
        }
    }
}

/// Services from the config's explicit list.
pub fn from_specs(specs: &[ServiceSpec], root: &Path, default_tag: &str) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();

    for spec in specs {
        if spec.name.trim().is_empty() {
            result.errors.push(StevedoreError::InvalidConfig {
                reason: "service name missing in services list".to_string(),
            });
            continue;
        }

        let path = resolve(root, Path::new(&spec.name));
        if let Err(e) = validate_dockerfile(&path) {
            result.errors.push(e);
            continue;
        }

        let raw = spec.image_name.clone().unwrap_or_else(|| service_name(&path));
        let image_name = normalize_image_name(&raw);
        if let Err(e) = validate_image_name(&image_name) {
            result.errors.push(e);
            continue;
        }

        let tag = spec.tag.as_deref().filter(|t| !t.is_empty()).unwrap_or(default_tag);
        result.services.push(ServiceDescriptor::new(path, image_name, tag));
    }

    result
}

/// Recursively find `Dockerfile`s under `dir`.
pub fn scan_dir(dir: &Path, default_tag: &str) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();

    if !dir.is_dir() {
        result.errors.push(StevedoreError::DiscoveryFailed {
            path: dir.to_path_buf(),
            reason: "services directory does not exist".to_string(),
        });
        return result;
    }

    for path in find_service_dirs(dir, &mut result.errors) {
        let image_name = normalize_image_name(&service_name(&path));
        match validate_image_name(&image_name) {
            Ok(()) => result.services.push(ServiceDescriptor::new(path, image_name, default_tag)),
            Err(e) => result.errors.push(e),
        }
    }

    result
}

/// Directories under `dir` holding a `Dockerfile`, in sorted walk order.
fn find_service_dirs(dir: &Path, errors: &mut Vec<StevedoreError>) -> Vec<PathBuf> {
    let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|e| {
        e.depth() == 0
            || !e.file_type().is_dir()
            || !is_excluded_dir(&e.file_name().to_string_lossy())
    });

    let mut found = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() && entry.file_name() == "Dockerfile" => {
                if let Some(parent) = entry.path().parent() {
                    found.push(parent.to_path_buf());
                }
            }
            Ok(_) => {}
            // An unreadable root hides every service; an unreadable subdirectory
            // should not hide its siblings.
            Err(e) if e.depth() == 0 => errors.push(StevedoreError::DiscoveryFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable directory");
            }
        }
    }
    found
}

fn is_excluded_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Services listed one path per line in `file`.
pub fn from_input_file(file: &Path, root: &Path, default_tag: &str) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();

    info!(file = %file.display(), "Reading changed services file");
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            result.errors.push(StevedoreError::io(file, e));
            return result;
        }
    };

    let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        warn!(file = %file.display(), "Input file contains no service paths");
        return result;
    }

    for line in &lines {
        let path = resolve(root, Path::new(line));
        if let Err(e) = validate_dockerfile(&path) {
            warn!(service = %line, error = %e, "Ignoring service from input file");
            result.errors.push(e);
            continue;
        }

        let image_name = normalize_image_name(&service_name(&path));
        if let Err(e) = validate_image_name(&image_name) {
            result.errors.push(e);
            continue;
        }
        result.services.push(ServiceDescriptor::new(path, image_name, default_tag));
    }

    if result.services.is_empty() {
        warn!(file = %file.display(), entries = lines.len(), "No valid services in input file");
    }
    result
}

/// Drop services whose path was already seen, keeping the first.
pub fn merge_sources(services: Vec<ServiceDescriptor>) -> Vec<ServiceDescriptor> {
    let mut seen = HashSet::new();
    services.into_iter().filter(|s| seen.insert(s.path.clone())).collect()
}

/// Write the paths of `services`, one per line.
pub fn write_changed_services(services: &[ServiceDescriptor], file: &Path) -> crate::Result<()> {
    let content =
        services.iter().map(|s| s.path.display().to_string()).collect::<Vec<_>>().join("\n");
    fs::write(file, content).map_err(|e| StevedoreError::io(file, e))?;
    info!(file = %file.display(), services = services.len(), "Wrote changed services");
    Ok(())
}

/// Convert a service name to a Docker-compatible kebab-case image name.
pub fn normalize_image_name(service_name: &str) -> String {
    let mut name = String::with_capacity(service_name.len());
    for c in service_name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' { c } else { '-' };
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }

    let name = name.trim_matches('-');
    match name.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => name.to_string(),
        _ => format!("service-{}", name),
    }
}

/// Image names are lowercase alphanumerics plus `.`, `_` and `-`, starting
/// with an alphanumeric.
pub fn validate_image_name(name: &str) -> crate::Result<()> {
    let invalid = |reason: &str| StevedoreError::InvalidImageName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name is empty")),
        Some(c) if !(c.is_ascii_lowercase() || c.is_ascii_digit()) => {
            return Err(invalid("must start with a lowercase letter or digit"));
        }
        Some(_) => {}
    }
    let allowed =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-');
    if chars.any(|c| !allowed(c)) {
        return Err(invalid("only lowercase alphanumerics, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Fails unless `service_path` contains a `Dockerfile`.
pub fn validate_dockerfile(service_path: &Path) -> crate::Result<()> {
    if service_path.join("Dockerfile").is_file() {
        return Ok(());
    }
    Err(StevedoreError::DiscoveryFailed {
        path: service_path.to_path_buf(),
        reason: "no Dockerfile found".to_string(),
    })
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    clean(&root.join(path))
}

/// Drop `.` components so equal paths compare equal.
fn clean(path: &Path) -> PathBuf {
    let cleaned: PathBuf = path.components().filter(|c| !matches!(c, Component::CurDir)).collect();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

fn service_name(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => crate::paths::absolute(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "service".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(root: &Path, rel: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        dir
    }

    #[test]
    fn test_normalize_image_name() {
        assert_eq!(normalize_image_name("User_Service"), "user-service");
        assert_eq!(normalize_image_name("my  api"), "my-api");
        assert_eq!(normalize_image_name("--edge--"), "edge");
        assert_eq!(normalize_image_name("api.v2"), "api.v2");
        assert_eq!(normalize_image_name("Café@Home"), "caf-home");
        assert_eq!(normalize_image_name(".hidden"), "service-.hidden");
        assert_eq!(normalize_image_name("___"), "service-");
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("api").is_ok());
        assert!(validate_image_name("api_v2.1-x").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("-api").is_err());
        assert!(validate_image_name("Api").is_err());
        assert!(validate_image_name("api/web").is_err());
    }

    #[test]
    fn test_scan_skips_excluded_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        service(root, "services/api");
        service(root, "services/User_Worker");
        service(root, "services/api/node_modules/dep");
        service(root, "services/.cache/ghost");
        service(root, "vendor/lib");

        let result = scan_dir(root, "v1");
        let mut names: Vec<_> = result.services.iter().map(|s| s.image_name.as_str()).collect();
        names.sort();

        assert_eq!(names, vec!["api", "user-worker"]);
        assert!(result.errors.is_empty());
        assert!(result.services.iter().all(|s| s.tag == "v1" && s.needs_build));
    }

    #[test]
    fn test_scan_order_is_sorted() {
        let tmp = TempDir::new().unwrap();
        for dir in ["svc/web", "svc/api", "svc/api/nested", "svc/batch"] {
            service(tmp.path(), dir);
        }

        let result = scan_dir(&tmp.path().join("svc"), "v1");
        let paths: Vec<_> =
            result.services.iter().map(|s| s.path.strip_prefix(tmp.path()).unwrap()).collect();

        assert_eq!(
            paths,
            vec![
                Path::new("svc/api"),
                Path::new("svc/api/nested"),
                Path::new("svc/batch"),
                Path::new("svc/web")
            ]
        );
    }

    #[test]
    fn test_scan_missing_dir_is_collected() {
        let tmp = TempDir::new().unwrap();
        let result = scan_dir(&tmp.path().join("nope"), "latest");

        assert!(result.services.is_empty());
        assert!(matches!(result.errors[0], StevedoreError::DiscoveryFailed { .. }));
    }

    #[test]
    fn test_explicit_specs() {
        let tmp = TempDir::new().unwrap();
        service(tmp.path(), "svc/api");
        let specs = vec![
            ServiceSpec {
                name: "svc/api".to_string(),
                image_name: Some("Public_API".to_string()),
                tag: Some("v2".to_string()),
            },
            ServiceSpec { name: "svc/missing".to_string(), ..Default::default() },
            ServiceSpec::default(),
        ];

        let result = from_specs(&specs, tmp.path(), "latest");

        assert_eq!(result.services.len(), 1);
        assert_eq!(result.services[0].image_name, "public-api");
        assert_eq!(result.services[0].tag, "v2");
        assert_eq!(result.services[0].name, "api");
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_input_file() {
        let tmp = TempDir::new().unwrap();
        service(tmp.path(), "svc/api");
        let file = tmp.path().join("changed.txt");
        fs::write(&file, "svc/api\n\n  svc/gone  \n").unwrap();

        let result = from_input_file(&file, tmp.path(), "latest");

        assert_eq!(result.services.len(), 1);
        assert_eq!(result.services[0].path, tmp.path().join("svc/api"));
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_empty_input_file_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("changed.txt");
        fs::write(&file, "\n  \n").unwrap();

        let result = from_input_file(&file, tmp.path(), "latest");
        assert!(result.services.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_merge_keeps_first_seen() {
        let a = ServiceDescriptor::new("svc/api", "api", "v1");
        let b = ServiceDescriptor::new("./svc/api", "api", "v2");
        let c = ServiceDescriptor::new("svc/web", "web", "v1");

        let merged = merge_sources(vec![a, b, c]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].tag, "v1");
        assert_eq!(merged[1].name, "web");
    }

    #[test]
    fn test_discover_without_sources_scans_root() {
        let tmp = TempDir::new().unwrap();
        service(tmp.path(), "a");
        service(tmp.path(), "b");

        let result = discover(&DiscoverySources::default(), tmp.path(), "latest");
        assert_eq!(result.services.len(), 2);
    }

    #[test]
    fn test_discover_merges_sources() {
        let tmp = TempDir::new().unwrap();
        service(tmp.path(), "services/api");
        service(tmp.path(), "services/web");
        let file = tmp.path().join("changed.txt");
        fs::write(&file, "services/api\n").unwrap();

        let sources = DiscoverySources {
            services: vec![ServiceSpec {
                name: "services/api".to_string(),
                tag: Some("pinned".to_string()),
                ..Default::default()
            }],
            services_dirs: vec![PathBuf::from("services")],
            input_file: Some(PathBuf::from("changed.txt")),
        };

        let result = discover(&sources, tmp.path(), "latest");

        assert_eq!(result.services.len(), 2);
        let api = result.services.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.tag, "pinned");
    }

    #[test]
    fn test_write_changed_services() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("out.txt");
        let services =
            vec![
                ServiceDescriptor::new("svc/api", "api", "v1"),
                ServiceDescriptor::new("svc/web", "web", "v1"),
            ];

        write_changed_services(&services, &file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "svc/api\nsvc/web");
    }
}
