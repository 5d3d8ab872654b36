//! Stage directory allocation and cleanup.
//!
//! Stage directories live under the staging root and are named after their
//! stage id: `<staging_root>/<stage_id>/`. Removal tolerates directories that
//! are already gone, because crash recovery may remove the same stage twice.

use std::path::{Path, PathBuf};

use fs_err as fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, StageError};
use crate::lock::StageId;

#[derive(Debug, Clone)]
pub struct StageDirectoryManager {
    staging_root: PathBuf,
}

impl StageDirectoryManager {
    pub fn new(staging_root: PathBuf) -> Self {
        Self { staging_root }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Where the directory of `stage_id` lives (whether or not it exists).
    pub fn stage_directory(&self, stage_id: &StageId) -> PathBuf {
        self.staging_root.join(stage_id.as_str())
    }

    /// Creates a fresh, empty directory for `stage_id`.
    pub fn create_stage_directory(&self, stage_id: &StageId) -> Result<PathBuf> {
        fs::create_dir_all(&self.staging_root).map_err(|e| {
            StageError::io(
                format!(
                    "Staging root {} is not writable",
                    self.staging_root.display()
                ),
                e,
            )
        })?;

        let path = self.stage_directory(stage_id);
        fs::create_dir(&path).map_err(|e| StageError::io("Failed to create stage directory", e))?;
        debug!(path = %path.display(), "Stage directory created");
        Ok(path)
    }

    /// Recursively deletes a stage directory. Already gone counts as success.
    pub fn remove_stage_directory(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Packages sometimes ship read-only directories.
                warn!(path = %path.display(), "Retrying stage removal after restoring write permission");
                make_tree_writable(path);
                fs::remove_dir_all(path)
                    .map_err(|e| StageError::io("Failed to remove stage directory", e))?;
            }
            Err(err) => return Err(StageError::io("Failed to remove stage directory", err)),
        }
        debug!(path = %path.display(), "Stage directory removed");
        Ok(())
    }

    /// Removes every stage directory except `keep`. Returns how many were
    /// removed.
    pub fn remove_orphans(&self, keep: Option<&StageId>) -> Result<usize> {
        let entries = match fs::read_dir(&self.staging_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(StageError::io("Failed to list staging root", err)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StageError::io("Failed to list staging root", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if keep.is_some_and(|id| id.as_str() == name) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            self.remove_stage_directory(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn make_tree_writable(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_symlink() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = std::fs::set_permissions(entry.path(), permissions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_remove() {
        let tmp = TempDir::new().unwrap();
        let manager = StageDirectoryManager::new(tmp.path().join("stages"));
        let id = StageId::from("abc");

        let path = manager.create_stage_directory(&id).unwrap();
        assert!(path.is_dir());
        assert_eq!(path, tmp.path().join("stages").join("abc"));

        manager.remove_stage_directory(&path).unwrap();
        assert!(!path.exists());
        // Second removal is fine.
        manager.remove_stage_directory(&path).unwrap();
    }

    #[test]
    fn creating_twice_fails() {
        let tmp = TempDir::new().unwrap();
        let manager = StageDirectoryManager::new(tmp.path().join("stages"));
        let id = StageId::from("abc");
        manager.create_stage_directory(&id).unwrap();
        assert!(matches!(
            manager.create_stage_directory(&id),
            Err(StageError::Io { .. })
        ));
    }

    #[test]
    fn orphans_are_removed_except_kept() {
        let tmp = TempDir::new().unwrap();
        let manager = StageDirectoryManager::new(tmp.path().join("stages"));
        let keep = StageId::from("keep");
        manager.create_stage_directory(&keep).unwrap();
        manager
            .create_stage_directory(&StageId::from("old-1"))
            .unwrap();
        manager
            .create_stage_directory(&StageId::from("old-2"))
            .unwrap();

        assert_eq!(manager.remove_orphans(Some(&keep)).unwrap(), 2);
        assert!(manager.stage_directory(&keep).exists());
        assert!(!manager.stage_directory(&StageId::from("old-1")).exists());
    }

    #[test]
    fn orphans_without_root_is_zero() {
        let tmp = TempDir::new().unwrap();
        let manager = StageDirectoryManager::new(tmp.path().join("missing"));
        assert_eq!(manager.remove_orphans(None).unwrap(), 0);
    }
}
