//! Single-slot ownership of the staging area.
//!
//! One JSON record per project root says which stage currently owns the
//! staging area, who created it and how far it has progressed.
//!
//! # Record Location
//!
//! `<state_dir>/locks/{hash}.json` where `{hash}` is MD5 of the project root.
//!
//! ```text
//! {
//!   "stage_id": "01hq3...",
//!   "owner": "01hq2...",
//!   "project_root": "/srv/site",
//!   "created_at": "2026-10-16T08:00:00Z",
//!   "updated_at": "2026-10-16T08:01:10Z",
//!   "phase": "staged",
//!   "metadata": { "package_versions": { ... }, "lock_file_hash": "..." }
//! }
//! ```
//!
//! # Compare-and-Set
//!
//! Creation writes a temp file next to the record and links it into place
//! with a no-clobber persist. Two concurrent `create` calls cannot both
//! succeed: the loser sees `AlreadyExists` and reports `AlreadyActive`.
//! Later rewrites (phase changes) use temp file + rename.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, StageError};
use crate::requirement::PackageVersions;
use crate::storage::StoragePaths;

/// Identifier of one stage, also the stage directory's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn generate() -> Self {
        StageId(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        StageId(value.to_string())
    }
}

impl From<String> for StageId {
    fn from(value: String) -> Self {
        StageId(value)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque credential identifying the logical session that owns a stage.
///
/// Handed out once to the caller that begins a stage and required for every
/// later claim.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn generate() -> Self {
        OwnerToken(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        OwnerToken(value.to_string())
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        OwnerToken(value)
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OwnerToken(..)")
    }
}

/// Where a stage is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    /// No stage exists.
    Available,
    /// Stage directory exists and holds a copy of the live codebase.
    Created,
    /// The package manager has run inside the stage.
    Staged,
    /// Copy-back in progress (the failure marker window).
    Applying,
    Applied,
    PostApplied,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StagePhase::Available => "available",
            StagePhase::Created => "created",
            StagePhase::Staged => "staged",
            StagePhase::Applying => "applying",
            StagePhase::Applied => "applied",
            StagePhase::PostApplied => "post-applied",
        };
        f.write_str(label)
    }
}

/// Shared data stored alongside a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    #[serde(default)]
    pub package_versions: PackageVersions,
    /// MD5 of the active composer.lock when the stage was created.
    #[serde(default)]
    pub lock_file_hash: Option<String>,
}

/// The persisted ownership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub stage_id: StageId,
    pub owner: OwnerToken,
    pub project_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: StagePhase,
    #[serde(default)]
    pub metadata: StageMetadata,
}

impl OwnershipRecord {
    fn is_expired(&self, ttl: Option<chrono::Duration>, now: DateTime<Utc>) -> bool {
        ttl.is_some_and(|ttl| now.signed_duration_since(self.created_at) > ttl)
    }
}

/// File-backed ownership lock for one project root.
#[derive(Debug, Clone)]
pub struct OwnershipLock {
    file: PathBuf,
    project_root: PathBuf,
    ttl: Option<chrono::Duration>,
}

impl OwnershipLock {
    pub fn new(storage: &StoragePaths, project_root: &Path, ttl: Option<chrono::Duration>) -> Self {
        Self {
            file: storage.lock_file(project_root),
            project_root: project_root.to_path_buf(),
            ttl,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Reads the record, expired or not.
    pub fn read(&self) -> Result<Option<OwnershipRecord>> {
        let content = match fs::read_to_string(&self.file) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StageError::io("Failed to read ownership record", err)),
        };
        let record = serde_json::from_str(&content).map_err(|e| {
            StageError::json(
                format!("Malformed ownership record {}", self.file.display()),
                e,
            )
        })?;
        Ok(Some(record))
    }

    /// The record if one exists and has not expired.
    pub fn active_record(&self) -> Result<Option<OwnershipRecord>> {
        let now = Utc::now();
        Ok(self
            .read()?
            .filter(|record| !record.is_expired(self.ttl, now)))
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.active_record()?.is_some())
    }

    /// Persists a new record for a fresh stage.
    ///
    /// Fails with `AlreadyActive` while an unexpired record exists. An expired
    /// record is replaced.
    pub fn create(&self, owner: &OwnerToken, metadata: StageMetadata) -> Result<OwnershipRecord> {
        if let Some(existing) = self.read()? {
            if !existing.is_expired(self.ttl, Utc::now()) {
                return Err(StageError::AlreadyActive {
                    stage_id: existing.stage_id.to_string(),
                });
            }
            warn!(
                stage_id = %existing.stage_id,
                created_at = %existing.created_at,
                "Replacing expired ownership record"
            );
            self.remove_file()?;
        }

        let now = Utc::now();
        let record = OwnershipRecord {
            stage_id: StageId::generate(),
            owner: owner.clone(),
            project_root: self.project_root.clone(),
            created_at: now,
            updated_at: now,
            phase: StagePhase::Created,
            metadata,
        };

        let temp_file = self.write_temp(&record)?;
        if let Err(err) = temp_file.persist_noclobber(&self.file) {
            if err.error.kind() == std::io::ErrorKind::AlreadyExists {
                let stage_id = self
                    .read()
                    .ok()
                    .flatten()
                    .map(|r| r.stage_id.to_string())
                    .unwrap_or_default();
                return Err(StageError::AlreadyActive { stage_id });
            }
            return Err(StageError::io("Failed to persist ownership record", err.error));
        }

        debug!(stage_id = %record.stage_id, path = %self.file.display(), "Ownership record created");
        Ok(record)
    }

    /// Verifies that `owner` owns `stage_id` and returns the record.
    pub fn claim(&self, stage_id: &StageId, owner: &OwnerToken) -> Result<OwnershipRecord> {
        let record = self.active_record()?.ok_or(StageError::NoActiveStage)?;
        if &record.stage_id != stage_id {
            return Err(StageError::WrongOwner {
                stage_id: stage_id.to_string(),
                details: format!("the active stage is {}", record.stage_id),
            });
        }
        if &record.owner != owner {
            return Err(StageError::WrongOwner {
                stage_id: stage_id.to_string(),
                details: "it is owned by another session".to_string(),
            });
        }
        Ok(record)
    }

    /// Applies `change` to the record of `stage_id` and rewrites it atomically.
    pub fn update(
        &self,
        stage_id: &StageId,
        change: impl FnOnce(&mut OwnershipRecord),
    ) -> Result<OwnershipRecord> {
        let mut record = self.read()?.ok_or(StageError::NoActiveStage)?;
        if &record.stage_id != stage_id {
            return Err(StageError::WrongOwner {
                stage_id: stage_id.to_string(),
                details: format!("the active stage is {}", record.stage_id),
            });
        }
        change(&mut record);
        record.updated_at = Utc::now();

        let temp_file = self.write_temp(&record)?;
        temp_file
            .persist(&self.file)
            .map_err(|e| StageError::io("Failed to rewrite ownership record", e.error))?;
        Ok(record)
    }

    pub fn set_phase(&self, stage_id: &StageId, phase: StagePhase) -> Result<OwnershipRecord> {
        self.update(stage_id, |record| record.phase = phase)
    }

    /// Deletes the record of `stage_id`. Releasing a missing record is a no-op;
    /// a record belonging to another stage is left alone.
    pub fn release(&self, stage_id: &StageId) -> Result<()> {
        match self.read()? {
            None => Ok(()),
            Some(record) if &record.stage_id == stage_id => self.remove_file(),
            Some(record) => {
                warn!(
                    requested = %stage_id,
                    active = %record.stage_id,
                    "Not releasing ownership record of another stage"
                );
                Ok(())
            }
        }
    }

    fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StageError::io("Failed to remove ownership record", err)),
        }
    }

    fn write_temp(&self, record: &OwnershipRecord) -> Result<NamedTempFile> {
        let parent_dir = self
            .file
            .parent()
            .ok_or_else(|| StageError::InvalidArgument("Lock path has no parent".into()))?;
        fs::create_dir_all(parent_dir)
            .map_err(|e| StageError::io("Failed to create locks directory", e))?;

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StageError::json("Failed to serialize ownership record", e))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| StageError::io("Failed to create temp ownership record", e))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| StageError::io("Failed to write temp ownership record", e))?;
        temp_file
            .flush()
            .map_err(|e| StageError::io("Failed to flush temp ownership record", e))?;
        Ok(temp_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(tmp: &TempDir, ttl: Option<chrono::Duration>) -> OwnershipLock {
        let storage = StoragePaths::with_root(tmp.path().join("state"));
        OwnershipLock::new(&storage, Path::new("/srv/site"), ttl)
    }

    #[test]
    fn create_then_create_again_fails() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let owner = OwnerToken::generate();

        let record = lock.create(&owner, StageMetadata::default()).unwrap();
        assert!(lock.is_active().unwrap());
        assert_eq!(record.phase, StagePhase::Created);

        let err = lock.create(&owner, StageMetadata::default()).unwrap_err();
        match err {
            StageError::AlreadyActive { stage_id } => {
                assert_eq!(stage_id, record.stage_id.to_string())
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn claim_returns_stored_metadata() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let owner = OwnerToken::generate();
        let mut metadata = StageMetadata::default();
        metadata
            .package_versions
            .runtime
            .insert("drupal/core".to_string(), "9.8.1".to_string());

        let record = lock.create(&owner, metadata.clone()).unwrap();
        let claimed = lock.claim(&record.stage_id, &owner).unwrap();
        assert_eq!(claimed.metadata, metadata);
    }

    #[test]
    fn claim_with_wrong_owner_or_id_fails() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let owner = OwnerToken::generate();
        let record = lock.create(&owner, StageMetadata::default()).unwrap();

        let err = lock
            .claim(&record.stage_id, &OwnerToken::generate())
            .unwrap_err();
        assert!(matches!(err, StageError::WrongOwner { .. }));

        let err = lock.claim(&StageId::from("other"), &owner).unwrap_err();
        assert!(matches!(err, StageError::WrongOwner { .. }));
    }

    #[test]
    fn claim_without_record_fails() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let err = lock
            .claim(&StageId::from("x"), &OwnerToken::generate())
            .unwrap_err();
        assert!(matches!(err, StageError::NoActiveStage));
    }

    #[test]
    fn release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let record = lock
            .create(&OwnerToken::generate(), StageMetadata::default())
            .unwrap();

        lock.release(&record.stage_id).unwrap();
        lock.release(&record.stage_id).unwrap();
        assert!(!lock.is_active().unwrap());
    }

    #[test]
    fn release_of_other_stage_keeps_record() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        lock.create(&OwnerToken::generate(), StageMetadata::default())
            .unwrap();
        lock.release(&StageId::from("someone-else")).unwrap();
        assert!(lock.is_active().unwrap());
    }

    #[test]
    fn phase_updates_persist() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, None);
        let record = lock
            .create(&OwnerToken::generate(), StageMetadata::default())
            .unwrap();

        lock.set_phase(&record.stage_id, StagePhase::Applying).unwrap();
        assert_eq!(lock.read().unwrap().unwrap().phase, StagePhase::Applying);
    }

    #[test]
    fn expired_record_is_inactive_and_replaceable() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp, Some(chrono::Duration::seconds(60)));
        let old = lock
            .create(&OwnerToken::generate(), StageMetadata::default())
            .unwrap();
        lock.update(&old.stage_id, |record| {
            record.created_at = Utc::now() - chrono::Duration::hours(2)
        })
        .unwrap();

        assert!(!lock.is_active().unwrap());
        let fresh = lock
            .create(&OwnerToken::generate(), StageMetadata::default())
            .unwrap();
        assert_ne!(fresh.stage_id, old.stage_id);
    }

    #[test]
    fn owner_token_debug_is_redacted() {
        let token = OwnerToken::from("secret-value");
        assert!(!format!("{:?}", token).contains("secret-value"));
    }
}
