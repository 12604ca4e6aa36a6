//! Filesystem walk for one allow-listed root.
//!
//! Symlinks are never followed (a link can point outside the root), hidden
//! entries are skipped unless configured otherwise, and only extensions in
//! `indexing.extensions` are reported. A walk that loses its root midway
//! returns what it saw so far with `complete = false`.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::config::IndexingConfig;
use crate::models::FileMeta;

/// Files found by a walk. `complete` is false if the root vanished or
/// could not be read, in which case nothing may be deleted.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<FileMeta>,
    /// False when the walk was cut short (root vanished or became unreadable).
    pub complete: bool,
    /// Per-entry errors that did not stop the walk.
    pub errors: u64,
}

pub fn scan_root(root: &Path, config: &IndexingConfig) -> Result<ScanOutcome> {
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut outcome = ScanOutcome {
        complete: true,
        ..Default::default()
    };

    let include_hidden = config.include_hidden;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || include_hidden || !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if !root.is_dir() {
                    tracing::warn!(root = %root.display(), "root disappeared during walk");
                    outcome.complete = false;
                    break;
                }
                tracing::debug!(error = %e, "skipping unreadable entry");
                outcome.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if exclude_set.is_match(relative) {
            continue;
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if extension.is_empty() || !config.accepts_extension(&extension) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => outcome.files.push(FileMeta {
                path: path.to_path_buf(),
                size: meta.len() as i64,
                mtime: mtime_millis(&meta),
                extension: format!(".{}", extension),
            }),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "metadata unavailable");
                outcome.errors += 1;
            }
        }
    }

    if outcome.complete && !root.is_dir() {
        outcome.complete = false;
    }

    // Sort for deterministic ordering
    outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(outcome)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

pub fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
