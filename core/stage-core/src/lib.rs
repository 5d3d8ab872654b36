//! # stage-core
//!
//! Staged package updates for a live PHP codebase: copy the codebase into an
//! isolated stage, run the package manager there, validate the result, sync
//! it back, and clean up, while surviving concurrent attempts and crashes
//! mid-apply.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Long steps block the caller.
//! - **Not thread-safe**: One lifecycle per caller; cross-process safety comes
//!   from the ownership record, not from in-process locks.
//! - **Explicit collaborators**: validators, exclusion providers, copiers and
//!   the package-manager runner are passed in, never looked up.
//! - **Fail loud on copy-back**: a failed apply leaves a marker file that
//!   blocks every later operation until an operator clears it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stage_core::{OwnerToken, PackageVersions, StageConfig, StageLifecycle, UpdatePolicy};
//!
//! let config = StageConfig::load(Path::new("stage.toml"))?;
//! let owner = OwnerToken::generate();
//! let mut stage = StageLifecycle::new(config, UpdatePolicy::Extensions, owner)?;
//!
//! let desired = PackageVersions::new().with_runtime("drupal/token", "1.13.0");
//! stage.begin(desired.clone(), None)?;
//! stage.require(desired.runtime, desired.dev, None)?;
//! stage.apply(None)?;
//! stage.post_apply(None)?;
//! stage.destroy(false, None)?;
//! ```

// Public modules
pub mod config;
pub mod copier;
pub mod error;
pub mod events;
pub mod exclusion;
pub mod failure_marker;
pub mod lifecycle;
pub mod lock;
pub mod manifest;
pub mod paths;
pub mod post_apply;
pub mod release;
pub mod requirement;
pub mod stage_dir;
pub mod storage;
pub mod tool;
pub mod unattended;
pub mod validators;

// Re-export commonly used items at crate root
pub use config::{DatabaseConfig, SiteConfig, StageConfig};
pub use copier::{Beginner, Committer, FileSyncer, SyncStats};
pub use error::{Result, StageError};
pub use events::{
    HookContext, Severity, StageEvent, StageValidator, ValidationError, ValidationResult,
};
pub use exclusion::{
    CopyDirection, ExclusionContext, ExclusionProvider, ExclusionRegistry, ExclusionRule,
    ExclusionSet, RuleBase, RuleScope,
};
pub use failure_marker::{FailureMarker, FailureMarkerContents};
pub use lifecycle::StageLifecycle;
pub use lock::{OwnerToken, OwnershipLock, OwnershipRecord, StageId, StageMetadata, StagePhase};
pub use manifest::{
    packages_only_in, packages_with_different_versions, ComposerJson, ManifestDiff, PackageEntry,
    PackageList, RequirementSection, VersionChange,
};
pub use post_apply::{CommandStep, PostApplyStep};
pub use release::{
    AvailableReleases, ReleaseInfo, ReleaseSelectionPolicy, ReleaseVersion, SelectionMode,
    SelectionOutcome, Stability, TargetRelease, UnattendedMode, VersionRule,
};
pub use requirement::{PackageVersions, UpdatePolicy};
pub use stage_dir::StageDirectoryManager;
pub use storage::StoragePaths;
pub use tool::{ComposerStager, Stager, ToolOutput};
pub use unattended::{Notifier, RecordingNotifier, RunOutcome, SkipReason, TracingNotifier, UnattendedRunner};
