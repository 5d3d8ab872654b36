//! Storage path management for stage bookkeeping.
//!
//! `StoragePaths` centralizes every path the engine writes outside the stage
//! directory itself: ownership records, logs and the default staging root.
//! Production code uses `StoragePaths::default()` (under the platform's local
//! data directory); tests use `StoragePaths::with_root(temp_dir)`.
//!
//! The failure marker is deliberately NOT under the state directory. It lives
//! in the project root so that it survives anything that wipes application
//! state; see [`crate::failure_marker`].

use std::path::{Path, PathBuf};

/// File name of the failure marker written into the project root.
pub const FAILURE_MARKER_FILE: &str = "STAGE_APPLY_FAILURE.json";

/// Central configuration for bookkeeping paths.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Root directory for engine state (default: <data_local_dir>/stagectl)
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: base.join("stagectl"),
        }
    }
}

impl StoragePaths {
    /// Creates StoragePaths with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Per-Project Paths
    // ─────────────────────────────────────────────────────────────────────────────

    /// Stable key for a project root: MD5 of its normalized path.
    pub fn project_key(project_root: &Path) -> String {
        let rendered = project_root.to_string_lossy();
        let trimmed = rendered.trim_end_matches('/');
        let normalized = if trimmed.is_empty() { "/" } else { trimmed };
        format!("{:x}", md5::compute(normalized))
    }

    /// Directory holding ownership records.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Ownership record for a project root.
    /// Example: <root>/locks/5d41402abc4b2a76b9719d911017c592.json
    pub fn lock_file(&self, project_root: &Path) -> PathBuf {
        self.locks_dir()
            .join(format!("{}.json", Self::project_key(project_root)))
    }

    /// Failure marker location for a project root.
    pub fn failure_marker_file(project_root: &Path) -> PathBuf {
        project_root.join(FAILURE_MARKER_FILE)
    }

    /// Default staging root when none is configured.
    /// Example: /tmp/.stage_manager5d41402abc4b
    pub fn default_staging_root(project_root: &Path) -> PathBuf {
        let key = Self::project_key(project_root);
        std::env::temp_dir().join(format!(".stage_manager{}", &key[..12]))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to logs/ directory (rolling CLI logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_key_ignores_trailing_slash() {
        assert_eq!(
            StoragePaths::project_key(Path::new("/srv/site/")),
            StoragePaths::project_key(Path::new("/srv/site"))
        );
    }

    #[test]
    fn lock_file_is_per_project() {
        let storage = StoragePaths::with_root(PathBuf::from("/state"));
        let a = storage.lock_file(Path::new("/srv/a"));
        let b = storage.lock_file(Path::new("/srv/b"));
        assert_ne!(a, b);
        assert!(a.starts_with("/state/locks"));
    }

    #[test]
    fn failure_marker_lives_in_project_root() {
        assert_eq!(
            StoragePaths::failure_marker_file(Path::new("/srv/site")),
            PathBuf::from("/srv/site/STAGE_APPLY_FAILURE.json")
        );
    }
}
