//! Error types for stage-core operations.
//!
//! Every fallible operation returns [`StageError`]. Validation vetoes are not
//! faults: they arrive as [`StageError::Validation`] carrying every message the
//! hooks produced, so callers can show the whole list at once.

use std::path::PathBuf;

use crate::events::ValidationError;
use crate::lock::StagePhase;

/// All errors that can occur in stage-core operations.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    // ─────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid update request: {0}")]
    InvalidArgument(String),

    #[error("Cannot {operation} while the stage is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: StagePhase,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Ownership Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cannot create a new stage because stage {stage_id} is already in use")]
    AlreadyActive { stage_id: String },

    #[error("Cannot claim stage {stage_id}: {details}")]
    WrongOwner { stage_id: String, details: String },

    #[error("Cannot continue because no stage has been created")]
    NoActiveStage,

    #[error("Cannot destroy stage {stage_id} while changes are being applied")]
    StageIsApplying { stage_id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Validation Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // ─────────────────────────────────────────────────────────────────────
    // Tool Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command failed: {command}: {details}")]
    ToolInvocation { command: String, details: String },

    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Post-apply step '{step}' failed: {details}")]
    PostApplyFailed { step: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Fatal Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error(
        "Staged changes failed to apply to {project_root} and the codebase may be in an \
         inconsistent state. Restore the code and database from a backup. ({source})"
    )]
    ApplyFailed {
        project_root: PathBuf,
        #[source]
        source: Box<StageError>,
    },

    #[error(
        "A previous update failed while applying changes ({message}). The codebase may be in \
         an inconsistent state; resolve it and clear the failure marker at {path}"
    )]
    FailureMarkerPresent { path: PathBuf, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },
}

impl StageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StageError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        StageError::Json {
            context: context.into(),
            source,
        }
    }

    /// Errors after which the live codebase cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StageError::ApplyFailed { .. } | StageError::FailureMarkerPresent { .. }
        )
    }

    /// Ownership violations: "someone else is already updating".
    pub fn is_ownership(&self) -> bool {
        matches!(
            self,
            StageError::AlreadyActive { .. }
                | StageError::WrongOwner { .. }
                | StageError::NoActiveStage
        )
    }
}

/// Convenience type alias for Results using StageError.
pub type Result<T> = std::result::Result<T, StageError>;

// Conversion for string error compatibility
impl From<StageError> for String {
    fn from(err: StageError) -> String {
        err.to_string()
    }
}
