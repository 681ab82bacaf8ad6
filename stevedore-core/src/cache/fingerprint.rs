//! Content fingerprints for service directories.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Compute the SHA-256 fingerprint of a service directory.
///
/// Regular files are visited in sorted path order so the result does not
/// depend on directory iteration order. Each file contributes its path
/// relative to `service_path` followed by its contents. `.git` trees and
/// `*.tmp` files are ignored.
pub fn service_hash(service_path: &Path) -> io::Result<String> {
    let walker = WalkDir::new(service_path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && e.file_name() == ".git"));

    let mut hasher = Sha256::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().ends_with(".tmp") {
            continue;
        }
        let relative = entry.path().strip_prefix(service_path).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut reader = fs::File::open(entry.path())?;
        io::copy(&mut reader, &mut hasher)?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// True for a 64-character lowercase hex digest.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}
