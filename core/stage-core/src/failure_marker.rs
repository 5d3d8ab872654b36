//! Durable marker for a crash during copy-back.
//!
//! Written immediately before a stage is synced over the live codebase and
//! removed immediately after that sync returns successfully. If the marker
//! exists at any other time, a previous apply died half way and the live
//! codebase cannot be trusted: every mutating operation refuses to run until
//! an operator clears it.
//!
//! The marker is a plain file in the project root on purpose. It must
//! survive the very crash it reports, so it does not depend on the lock store
//! or any other state. Destroying a stage never removes it.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{Result, StageError};
use crate::lock::StageId;

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMarkerContents {
    pub stage_id: StageId,
    pub message: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureMarker {
    path: PathBuf,
}

impl FailureMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes the marker, replacing any existing one.
    pub fn write(&self, stage_id: &StageId, message: &str) -> Result<()> {
        let contents = FailureMarkerContents {
            stage_id: stage_id.clone(),
            message: message.to_string(),
            written_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&contents)
            .map_err(|e| StageError::json("Failed to serialize failure marker", e))?;

        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| StageError::InvalidArgument("Marker path has no parent".into()))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| StageError::io("Failed to create temp failure marker", e))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| StageError::io("Failed to write failure marker", e))?;
        // The marker must be on disk before copy-back starts.
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| StageError::io("Failed to sync failure marker", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| StageError::io("Failed to persist failure marker", e.error))?;
        Ok(())
    }

    /// Reads the marker. An unparseable marker is still a marker: its raw
    /// text becomes the message.
    pub fn read(&self) -> Result<Option<FailureMarkerContents>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StageError::io("Failed to read failure marker", err)),
        };
        match serde_json::from_str(&content) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "Unparseable failure marker");
                Ok(Some(FailureMarkerContents {
                    stage_id: StageId::from("unknown"),
                    message: content.trim().to_string(),
                    written_at: Utc::now(),
                }))
            }
        }
    }

    /// Fails with `FailureMarkerPresent` if the marker exists.
    pub fn assert_absent(&self) -> Result<()> {
        match self.read()? {
            None => Ok(()),
            Some(contents) => Err(StageError::FailureMarkerPresent {
                path: self.path.clone(),
                message: contents.message,
            }),
        }
    }

    /// Removes the marker. Used after a successful copy-back and by operators
    /// once they have restored a consistent codebase.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Failure marker cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StageError::io("Failed to remove failure marker", err)),
        }
    }
}
