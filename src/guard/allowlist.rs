//! Path allow-listing.
//!
//! A path is admitted only if its canonical form lives under a configured
//! root. Canonicalization resolves `..` and symlinks, so both traversal and
//! symlink escape land outside and are denied. Paths that do not exist are
//! normalized lexically: inside a root they are `NotFound`, anything else is
//! `AccessDenied`.

use std::path::{Component, Path, PathBuf};

use crate::error::{ApiError, ApiResult};

/// Canonicalized configured roots.
#[derive(Debug, Clone)]
pub struct AllowList {
    /// Canonical form when the root exists, lexically normalized otherwise.
    roots: Vec<PathBuf>,
}

impl AllowList {
    pub fn new(configured: &[PathBuf]) -> Self {
        let mut roots: Vec<PathBuf> = configured
            .iter()
            .map(|r| std::fs::canonicalize(r).unwrap_or_else(|_| normalize(r)))
            .collect();
        roots.dedup();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve a caller-supplied path to its canonical form inside a root.
    pub fn resolve(&self, raw: &str) -> ApiResult<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ApiError::validation("path must not be empty"));
        }
        if raw.contains('\0') {
            return Err(ApiError::validation("path contains a NUL byte"));
        }
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(ApiError::denied(format!("path must be absolute: {}", raw)));
        }

        match std::fs::canonicalize(path) {
            Ok(canonical) => {
                if self.owning_root(&canonical).is_some() {
                    Ok(canonical)
                } else {
                    tracing::warn!(path = %raw, resolved = %canonical.display(), "path outside allow-list");
                    Err(ApiError::denied(format!("{} is outside the allowed roots", raw)))
                }
            }
            Err(_) => {
                let lexical = normalize(path);
                if self.owning_root(&lexical).is_some() {
                    Err(ApiError::NotFound(raw.to_string()))
                } else {
                    tracing::warn!(path = %raw, "path outside allow-list");
                    Err(ApiError::denied(format!("{} is outside the allowed roots", raw)))
                }
            }
        }
    }

    /// The configured root containing `path` (the root itself included).
    pub fn owning_root(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(|r| r.as_path())
    }

    /// Resolve caller-requested search roots. An empty request means every
    /// allow-listed root.
    pub fn restrict(&self, requested: &[String]) -> ApiResult<Vec<PathBuf>> {
        if requested.is_empty() {
            return Ok(self.roots.clone());
        }
        let mut resolved = Vec::with_capacity(requested.len());
        for raw in requested {
            let path = self.resolve(raw)?;
            if !path.is_dir() {
                return Err(ApiError::validation(format!("{} is not a directory", raw)));
            }
            if !resolved.contains(&path) {
                resolved.push(path);
            }
        }
        Ok(resolved)
    }
}

/// Lexical normalization: drops `.` and folds `..` without touching disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
