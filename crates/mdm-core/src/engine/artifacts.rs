//! Partial output cleanup after a cancelled run.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

const ARTIFACT_SUFFIXES: &[&str] = &[
    ".mp4", ".webm", ".mp3", ".m4a", ".mkv", ".part", ".ytdl", ".temp",
];

/// Format-specific intermediate files (`name.f137.mp4`).
static FORMAT_FRAGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+(\.|$)").unwrap());

/// Whether `file_name` is output the tools may have produced for `base_name`.
pub(crate) fn is_artifact(file_name: &str, base_name: &str) -> bool {
    let Some(rest) = file_name.strip_prefix(base_name) else {
        return false;
    };
    // `clip.mp4` belongs to `clip`, `clip2.mp4` does not.
    if !rest.starts_with('.') {
        return false;
    }
    ARTIFACT_SUFFIXES.iter().any(|s| rest.ends_with(s))
        || rest.contains(".part-")
        || FORMAT_FRAGMENT_RE.is_match(rest)
}

/// Delete matching files in `dir`. Must only run once the process is gone.
/// Returns the number of files deleted.
pub(crate) fn delete_partial_files(dir: &Path, base_name: &str) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("scan {} for partial files: {}", dir.display(), e);
            return 0;
        }
    };
    let mut deleted = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_artifact(name, base_name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("deleted partial file {}", path.display());
                deleted += 1;
            }
            Err(e) => tracing::warn!("cannot delete partial file {}: {}", path.display(), e),
        }
    }
    deleted
}
