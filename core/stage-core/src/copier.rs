//! Bulk directory synchronization between the live codebase and a stage.
//!
//! Two seams, one per direction:
//!
//! - [`Beginner`]: populate an empty stage from the live directory.
//! - [`Committer`]: sync a stage back over the live directory.
//!
//! The package-manager side (running the tool inside the stage) is the third
//! seam, [`crate::tool::Stager`].
//!
//! [`FileSyncer`] implements both directions as a one-way mirror: after a
//! sync, every non-excluded path of the destination matches the source.
//! Excluded paths are skipped on both sides, so they are neither copied
//! into the destination nor deleted from it.

use std::path::Path;
use std::time::{Duration, Instant};

use fs_err as fs;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, StageError};
use crate::exclusion::ExclusionSet;
use crate::paths;

/// Populates a stage from the live directory.
pub trait Beginner {
    fn begin(
        &self,
        active: &Path,
        stage: &Path,
        exclusions: &ExclusionSet,
        timeout: Option<Duration>,
    ) -> Result<()>;
}

/// Syncs a stage back over the live directory.
pub trait Committer {
    fn commit(
        &self,
        stage: &Path,
        active: &Path,
        exclusions: &ExclusionSet,
        timeout: Option<Duration>,
    ) -> Result<()>;
}

/// Counters from one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub files_copied: usize,
    pub files_unchanged: usize,
    pub dirs_created: usize,
    pub entries_deleted: usize,
}

/// Filesystem mirror used for both copy directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSyncer;

struct Deadline {
    operation: &'static str,
    limit: Option<(Instant, Duration)>,
}

impl Deadline {
    fn new(operation: &'static str, timeout: Option<Duration>) -> Self {
        Self {
            operation,
            limit: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    fn check(&self) -> Result<()> {
        match self.limit {
            Some((at, timeout)) if Instant::now() >= at => Err(StageError::Timeout {
                operation: self.operation.to_string(),
                seconds: timeout.as_secs(),
            }),
            _ => Ok(()),
        }
    }
}

fn relative_of(root: &Path, entry: &DirEntry) -> Option<String> {
    let relative = entry.path().strip_prefix(root).ok()?;
    paths::normalize_relative(&paths::to_slash(relative))
}

fn walk_error(root: &Path, err: walkdir::Error) -> StageError {
    let context = format!("Failed to walk {}", root.display());
    match err.into_io_error() {
        Some(io) => StageError::io(context, io),
        None => StageError::io(
            context,
            std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"),
        ),
    }
}

/// Byte-for-byte comparison, short-circuiting on size.
fn same_file_contents(a: &Path, b: &Path) -> Result<bool> {
    let (meta_a, meta_b) = match (fs::metadata(a), fs::metadata(b)) {
        (Ok(meta_a), Ok(meta_b)) => (meta_a, meta_b),
        _ => return Ok(false),
    };
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    if meta_a.permissions().readonly() != meta_b.permissions().readonly() {
        return Ok(false);
    }
    let bytes_a = fs::read(a).map_err(|e| StageError::io("Failed to compare files", e))?;
    let bytes_b = fs::read(b).map_err(|e| StageError::io("Failed to compare files", e))?;
    Ok(bytes_a == bytes_b)
}

fn remove_any(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StageError::io("Failed to inspect path", err)),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path).map_err(|e| StageError::io("Failed to remove directory", e))
    } else {
        fs::remove_file(path).map_err(|e| StageError::io("Failed to remove file", e))
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> Result<bool> {
    let target =
        fs::read_link(source).map_err(|e| StageError::io("Failed to read symlink", e))?;
    if let Ok(existing) = std::fs::read_link(dest) {
        if existing == target {
            return Ok(false);
        }
    }
    remove_any(dest)?;
    std::os::unix::fs::symlink(&target, dest).map_err(|e| {
        StageError::io(format!("Failed to create symlink {}", dest.display()), e)
    })?;
    Ok(true)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, dest: &Path) -> Result<bool> {
    copy_file(source, dest)
}

fn copy_file(source: &Path, dest: &Path) -> Result<bool> {
    match fs::symlink_metadata(dest) {
        Ok(metadata) if metadata.is_file() => {
            if same_file_contents(source, dest)? {
                return Ok(false);
            }
        }
        Ok(_) => remove_any(dest)?,
        Err(_) => {}
    }
    fs::copy(source, dest).map_err(|e| StageError::io("Failed to copy file", e))?;
    Ok(true)
}

impl FileSyncer {
    /// Mirrors `source` onto `dest`, skipping excluded paths on both sides.
    pub fn sync(
        &self,
        source: &Path,
        dest: &Path,
        exclusions: &ExclusionSet,
        timeout: Option<Duration>,
        operation: &'static str,
    ) -> Result<SyncStats> {
        let deadline = Deadline::new(operation, timeout);
        let mut stats = SyncStats::default();

        if !source.is_dir() {
            return Err(StageError::io(
                format!("Cannot sync from {}", source.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "source is not a directory"),
            ));
        }
        fs::create_dir_all(dest).map_err(|e| StageError::io("Failed to create destination", e))?;

        // Pass 1: copy source → dest.
        let walker = WalkDir::new(source)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                relative_of(source, entry).map_or(true, |rel| !exclusions.covers(&rel))
            });
        for entry in walker {
            deadline.check()?;
            let entry = entry.map_err(|e| walk_error(source, e))?;
            let Some(relative) = relative_of(source, &entry) else {
                continue;
            };
            let target = dest.join(&relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                match fs::symlink_metadata(&target) {
                    Ok(metadata) if metadata.is_dir() => {}
                    Ok(_) => {
                        remove_any(&target)?;
                        fs::create_dir(&target)
                            .map_err(|e| StageError::io("Failed to create directory", e))?;
                        stats.dirs_created += 1;
                    }
                    Err(_) => {
                        fs::create_dir(&target)
                            .map_err(|e| StageError::io("Failed to create directory", e))?;
                        stats.dirs_created += 1;
                    }
                }
            } else if file_type.is_symlink() {
                if copy_symlink(entry.path(), &target)? {
                    stats.files_copied += 1;
                } else {
                    stats.files_unchanged += 1;
                }
            } else if copy_file(entry.path(), &target)? {
                stats.files_copied += 1;
            } else {
                stats.files_unchanged += 1;
            }
        }

        // Pass 2: delete what the source no longer has. Children come first,
        // so a directory emptied here is removed when its own entry arrives.
        // Directories still holding excluded paths are kept.
        let walker = WalkDir::new(dest)
            .follow_links(false)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_entry(|entry| {
                relative_of(dest, entry).map_or(true, |rel| !exclusions.covers(&rel))
            });
        for entry in walker {
            deadline.check()?;
            let entry = entry.map_err(|e| walk_error(dest, e))?;
            let Some(relative) = relative_of(dest, &entry) else {
                continue;
            };
            if fs::symlink_metadata(source.join(&relative)).is_ok() {
                continue;
            }

            if entry.file_type().is_dir() {
                let is_empty = fs::read_dir(entry.path())
                    .map_err(|e| StageError::io("Failed to list directory", e))?
                    .next()
                    .is_none();
                if is_empty {
                    fs::remove_dir(entry.path())
                        .map_err(|e| StageError::io("Failed to remove directory", e))?;
                    stats.entries_deleted += 1;
                } else {
                    debug!(path = %relative, "Keeping directory that holds excluded paths");
                }
            } else {
                fs::remove_file(entry.path())
                    .map_err(|e| StageError::io("Failed to remove file", e))?;
                stats.entries_deleted += 1;
            }
        }

        info!(
            operation,
            source = %source.display(),
            dest = %dest.display(),
            copied = stats.files_copied,
            unchanged = stats.files_unchanged,
            deleted = stats.entries_deleted,
            excluded = exclusions.len(),
            "Sync complete"
        );
        Ok(stats)
    }
}

impl Beginner for FileSyncer {
    fn begin(
        &self,
        active: &Path,
        stage: &Path,
        exclusions: &ExclusionSet,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.sync(active, stage, exclusions, timeout, "begin")
            .map(|_| ())
    }
}

impl Committer for FileSyncer {
    fn commit(
        &self,
        stage: &Path,
        active: &Path,
        exclusions: &ExclusionSet,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.sync(stage, active, exclusions, timeout, "commit")
            .map(|_| ())
    }
}
