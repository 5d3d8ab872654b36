//! The staged update state machine.
//!
//! ```text
//! Available ─begin─▶ Created ─require─▶ Staged ─apply─▶ Applying ─▶ Applied
//!     ▲                 │  ▲──require──┘    │                         │
//!     │                 │                   │                   post_apply
//!     └─────destroy─────┴───────────────────┴──── PostApplied ◀──────┘
//! ```
//!
//! One lifecycle instance works for one owner token. The ownership record
//! (see [`crate::lock`]) is the source of truth: every mutating operation
//! re-claims it first, so a second process holding the same token resumes
//! exactly where the first left off, and any other token is refused.
//!
//! # Failure handling
//!
//! - Pre-hook vetoes return [`StageError::Validation`] and change nothing.
//!   A pre-create veto also releases the ownership record it just took.
//! - Tool failures during `require` leave the stage as it was.
//! - A failed copy-back returns [`StageError::ApplyFailed`]. The failure
//!   marker and the `applying` phase are left in place on purpose; only an
//!   operator clears the marker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::StageConfig;
use crate::copier::{Beginner, Committer, FileSyncer};
use crate::error::{Result, StageError};
use crate::events::{
    self, HookContext, Severity, StageEvent, StageValidator, ValidationError, ValidationResult,
};
use crate::exclusion::{
    CopyDirection, ExclusionContext, ExclusionProvider, ExclusionRegistry, ExclusionSet,
};
use crate::failure_marker::FailureMarker;
use crate::lock::{OwnerToken, OwnershipLock, OwnershipRecord, StageId, StageMetadata, StagePhase};
use crate::manifest::{self, ComposerJson, PackageList, RequirementSection};
use crate::post_apply::{CommandStep, PostApplyStep};
use crate::requirement::{PackageVersions, UpdatePolicy};
use crate::stage_dir::StageDirectoryManager;
use crate::storage::FAILURE_MARKER_FILE;
use crate::tool::{ComposerStager, Stager};
use crate::validators;

/// The stage this instance is attached to.
#[derive(Debug, Clone)]
struct Session {
    stage_id: StageId,
    stage_dir: PathBuf,
    phase: StagePhase,
    metadata: StageMetadata,
}

impl Session {
    fn from_record(record: OwnershipRecord, stage_dir: PathBuf) -> Self {
        Self {
            stage_id: record.stage_id,
            stage_dir,
            phase: record.phase,
            metadata: record.metadata,
        }
    }
}

pub struct StageLifecycle {
    config: StageConfig,
    policy: UpdatePolicy,
    owner: OwnerToken,
    lock: OwnershipLock,
    marker: FailureMarker,
    dirs: StageDirectoryManager,
    exclusions: ExclusionRegistry,
    validators: Vec<Box<dyn StageValidator>>,
    post_apply_steps: Vec<Box<dyn PostApplyStep>>,
    stager: Box<dyn Stager>,
    beginner: Box<dyn Beginner>,
    committer: Box<dyn Committer>,
    session: Option<Session>,
}

impl std::fmt::Debug for StageLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLifecycle")
            .field("project_root", &self.config.project_root)
            .field("policy", &self.policy)
            .field("exclusions", &self.exclusions)
            .field("validators", &self.validators.len())
            .field("session", &self.session)
            .finish()
    }
}

impl StageLifecycle {
    /// A lifecycle with the built-in validators, exclusion providers and
    /// copiers, Composer as the package manager, and one post-apply step per
    /// configured command.
    pub fn new(config: StageConfig, policy: UpdatePolicy, owner: OwnerToken) -> Result<Self> {
        let storage = config.storage();
        let lock = OwnershipLock::new(&storage, &config.project_root, config.lock_ttl());
        let marker = FailureMarker::new(config.failure_marker_path());
        let dirs = StageDirectoryManager::new(config.staging_root());
        let exclusions = ExclusionRegistry::with_defaults(config.extra_exclusions.clone());
        let stager = ComposerStager::new(config.composer_executable.clone());

        let mut post_apply_steps: Vec<Box<dyn PostApplyStep>> = Vec::new();
        for argv in &config.post_apply_commands {
            post_apply_steps.push(Box::new(CommandStep::new(argv.clone())?));
        }

        Ok(Self {
            config,
            policy,
            owner,
            lock,
            marker,
            dirs,
            exclusions,
            validators: validators::default_validators(),
            post_apply_steps,
            stager: Box::new(stager),
            beginner: Box::new(FileSyncer),
            committer: Box::new(FileSyncer),
            session: None,
        })
    }

    pub fn with_stager(mut self, stager: impl Stager + 'static) -> Self {
        self.stager = Box::new(stager);
        self
    }

    pub fn with_beginner(mut self, beginner: impl Beginner + 'static) -> Self {
        self.beginner = Box::new(beginner);
        self
    }

    pub fn with_committer(mut self, committer: impl Committer + 'static) -> Self {
        self.committer = Box::new(committer);
        self
    }

    /// Appends a validator after the built-in ones.
    pub fn with_validator(mut self, validator: impl StageValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn with_exclusion_provider(mut self, provider: impl ExclusionProvider + 'static) -> Self {
        self.exclusions.register(Box::new(provider));
        self
    }

    pub fn with_post_apply_step(mut self, step: impl PostApplyStep + 'static) -> Self {
        self.post_apply_steps.push(Box::new(step));
        self
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a stage for `desired` and fills it from the live codebase.
    pub fn begin(&mut self, desired: PackageVersions, timeout: Option<Duration>) -> Result<StageId> {
        if let Some(session) = &self.session {
            return Err(StageError::InvalidState {
                operation: "begin",
                phase: session.phase,
            });
        }
        self.marker.assert_absent()?;
        self.policy.validate(&desired, &self.config.core_packages)?;

        let metadata = StageMetadata {
            package_versions: desired,
            lock_file_hash: manifest::lock_file_hash(&self.config.project_root)?,
        };
        let record = self.lock.create(&self.owner, metadata)?;
        let stage_id = record.stage_id.clone();
        let stage_dir = self.dirs.stage_directory(&stage_id);

        if let Err(err) = self.fire(
            StageEvent::PreCreate,
            Some(&stage_id),
            Some(&stage_dir),
            Some(&record.metadata),
        ) {
            self.release_quietly(&stage_id);
            return Err(err);
        }

        if let Err(err) = self.dirs.create_stage_directory(&stage_id) {
            self.release_quietly(&stage_id);
            return Err(err);
        }
        self.session = Some(Session::from_record(record, stage_dir.clone()));

        let copied = self
            .collect_exclusions(CopyDirection::IntoStage)
            .and_then(|exclusions| {
                self.beginner.begin(
                    &self.config.project_root,
                    &stage_dir,
                    &exclusions,
                    timeout,
                )
            });
        if let Err(err) = copied {
            warn!(stage_id = %stage_id, error = %err, "Copy into stage failed, cleaning up");
            if let Err(cleanup) = self.dirs.remove_stage_directory(&stage_dir) {
                warn!(stage_id = %stage_id, error = %cleanup, "Failed to remove stage directory");
            }
            self.release_quietly(&stage_id);
            self.session = None;
            return Err(err);
        }

        info!(stage_id = %stage_id, path = %stage_dir.display(), "Stage created");
        self.fire_current(StageEvent::PostCreate)?;
        Ok(stage_id)
    }

    /// Re-attaches to an existing stage. Only the owner that created it may.
    pub fn claim(&mut self, stage_id: &StageId) -> Result<OwnershipRecord> {
        self.marker.assert_absent()?;
        let record = self.lock.claim(stage_id, &self.owner)?;
        let stage_dir = self.dirs.stage_directory(stage_id);
        self.session = Some(Session::from_record(record.clone(), stage_dir));
        debug!(stage_id = %stage_id, phase = %record.phase, "Stage claimed");
        Ok(record)
    }

    /// Adds requirements to the stage and runs the package manager there.
    ///
    /// Three tool invocations, in this order: runtime requirements, dev
    /// requirements, then the dependency update.
    pub fn require(
        &mut self,
        runtime: BTreeMap<String, String>,
        dev: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.refresh_session()?;
        self.marker.assert_absent()?;
        self.expect_phase("require", &[StagePhase::Created, StagePhase::Staged])?;
        if runtime.is_empty() && dev.is_empty() {
            return Err(StageError::InvalidArgument(
                "No packages were given to require".to_string(),
            ));
        }

        let (stage_id, stage_dir) = self.current_stage()?;
        let record = self.lock.update(&stage_id, |record| {
            record
                .metadata
                .package_versions
                .runtime
                .extend(runtime.clone());
            record.metadata.package_versions.dev.extend(dev.clone());
        })?;
        if let Some(session) = self.session.as_mut() {
            session.metadata = record.metadata;
        }

        self.fire_current(StageEvent::PreRequire)?;

        let timeout = timeout.or(self.config.tool_timeout());
        for (section, packages) in [
            (RequirementSection::Require, &runtime),
            (RequirementSection::RequireDev, &dev),
        ] {
            if packages.is_empty() {
                continue;
            }
            let mut args = vec!["require".to_string()];
            if section == RequirementSection::RequireDev {
                args.push("--dev".to_string());
            }
            args.push("--no-update".to_string());
            args.extend(packages.iter().map(|(name, version)| format!("{name}:{version}")));
            self.stager.stage(&stage_dir, &args, timeout)?;
        }

        let mut update_args = vec![
            "update".to_string(),
            "--with-all-dependencies".to_string(),
        ];
        update_args.extend(runtime.keys().chain(dev.keys()).cloned());
        self.stager.stage(&stage_dir, &update_args, timeout)?;

        self.warn_on_missing_requirements(&stage_dir, &runtime, &dev);

        self.lock.set_phase(&stage_id, StagePhase::Staged)?;
        self.set_session_phase(StagePhase::Staged);
        info!(stage_id = %stage_id, runtime = runtime.len(), dev = dev.len(), "Requirements staged");

        self.fire_current(StageEvent::PostRequire)
    }

    /// Syncs the stage over the live codebase.
    pub fn apply(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.refresh_session()?;
        self.marker.assert_absent()?;
        self.expect_phase("apply", &[StagePhase::Staged])?;
        self.fire_current(StageEvent::PreApply)?;

        let (stage_id, stage_dir) = self.current_stage()?;
        let exclusions = self.collect_exclusions(CopyDirection::BackToActive)?;

        // Marker first: a recorded `applying` phase must always have one.
        self.marker.write(
            &stage_id,
            &format!(
                "Staged changes of stage {stage_id} failed to apply to {}",
                self.config.project_root.display()
            ),
        )?;
        if let Err(err) = self.lock.set_phase(&stage_id, StagePhase::Applying) {
            // Nothing was copied yet.
            if let Err(clear_err) = self.marker.clear() {
                warn!(stage_id = %stage_id, error = %clear_err, "Failed to clear failure marker");
            }
            return Err(err);
        }
        self.set_session_phase(StagePhase::Applying);

        if let Err(err) =
            self.committer
                .commit(&stage_dir, &self.config.project_root, &exclusions, timeout)
        {
            error!(
                stage_id = %stage_id,
                error = %err,
                marker = %self.marker.path().display(),
                "Copy-back failed; live codebase may be inconsistent"
            );
            return Err(StageError::ApplyFailed {
                project_root: self.config.project_root.clone(),
                source: Box::new(err),
            });
        }

        self.marker.clear()?;
        // The applied lock file is now the baseline for drift checks.
        let lock_file_hash = manifest::lock_file_hash(&self.config.project_root)?;
        let record = self.lock.update(&stage_id, |record| {
            record.phase = StagePhase::Applied;
            record.metadata.lock_file_hash = lock_file_hash;
        })?;
        if let Some(session) = self.session.as_mut() {
            session.phase = record.phase;
            session.metadata = record.metadata;
        }
        info!(stage_id = %stage_id, "Staged changes applied");

        self.fire_current(StageEvent::PostApply)
    }

    /// Runs every post-apply step. All steps are attempted; the first
    /// failure is returned and the stage stays `applied` so the steps can
    /// be retried.
    pub fn post_apply(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.refresh_session()?;
        self.expect_phase("run post-apply steps", &[StagePhase::Applied])?;
        let (stage_id, _) = self.current_stage()?;

        let mut first_failure = None;
        for step in &self.post_apply_steps {
            let name = step.name();
            match step.run(&self.config.project_root, timeout) {
                Ok(()) => debug!(step = %name, "Post-apply step finished"),
                Err(err) => {
                    warn!(step = %name, error = %err, "Post-apply step failed");
                    if first_failure.is_none() {
                        first_failure = Some(StageError::PostApplyFailed {
                            step: name,
                            details: err.to_string(),
                        });
                    }
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        self.lock.set_phase(&stage_id, StagePhase::PostApplied)?;
        self.set_session_phase(StagePhase::PostApplied);
        info!(stage_id = %stage_id, steps = self.post_apply_steps.len(), "Post-apply finished");
        Ok(())
    }

    /// Removes the stage and releases ownership.
    ///
    /// With `force`, ownership is not checked, pre-destroy vetoes are
    /// ignored, and a stage stuck in `applying` may be removed. The failure
    /// marker is never touched.
    pub fn destroy(&mut self, force: bool, message: Option<&str>) -> Result<()> {
        let session = if force {
            match &self.session {
                Some(session) => Some(session.clone()),
                None => self.lock.read()?.map(|record| {
                    let stage_dir = self.dirs.stage_directory(&record.stage_id);
                    Session::from_record(record, stage_dir)
                }),
            }
        } else {
            self.refresh_session()?;
            self.session.clone()
        };

        let Some(session) = session else {
            self.sweep_orphans();
            return Ok(());
        };

        if session.phase == StagePhase::Applying && !force {
            return Err(StageError::StageIsApplying {
                stage_id: session.stage_id.to_string(),
            });
        }

        let pre_destroy = self.fire(
            StageEvent::PreDestroy,
            Some(&session.stage_id),
            Some(&session.stage_dir),
            Some(&session.metadata),
        );
        match pre_destroy {
            Ok(()) => {}
            Err(err) if force => {
                warn!(stage_id = %session.stage_id, error = %err, "Ignoring pre-destroy veto");
            }
            Err(err) => return Err(err),
        }

        self.dirs.remove_stage_directory(&session.stage_dir)?;
        self.lock.release(&session.stage_id)?;
        self.session = None;
        info!(
            stage_id = %session.stage_id,
            force,
            message = message.unwrap_or(""),
            "Stage destroyed"
        );

        self.sweep_orphans();
        self.fire(
            StageEvent::PostDestroy,
            Some(&session.stage_id),
            None,
            Some(&session.metadata),
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn failure_marker(&self) -> &FailureMarker {
        &self.marker
    }

    pub fn stage_id(&self) -> Option<&StageId> {
        self.session.as_ref().map(|s| &s.stage_id)
    }

    /// Phase of the attached stage, `Available` when detached.
    pub fn phase(&self) -> StagePhase {
        self.session
            .as_ref()
            .map_or(StagePhase::Available, |s| s.phase)
    }

    pub fn stage_directory(&self) -> Result<&Path> {
        self.session
            .as_ref()
            .map(|s| s.stage_dir.as_path())
            .ok_or(StageError::NoActiveStage)
    }

    pub fn active_manifest(&self) -> Result<PackageList> {
        PackageList::load(&self.config.project_root, &self.config.vendor_dir)
    }

    pub fn staged_manifest(&self) -> Result<PackageList> {
        PackageList::load(self.stage_directory()?, &self.config.vendor_dir)
    }

    pub fn package_versions(&self) -> Result<&PackageVersions> {
        self.session
            .as_ref()
            .map(|s| &s.metadata.package_versions)
            .ok_or(StageError::NoActiveStage)
    }

    /// The unexpired ownership record of the project, whoever owns it.
    pub fn active_record(&self) -> Result<Option<OwnershipRecord>> {
        self.lock.active_record()
    }

    /// True when no unexpired stage exists for the project, in any process.
    pub fn is_available(&self) -> Result<bool> {
        Ok(!self.lock.is_active()?)
    }

    /// True while some process is copying a stage back (or crashed doing so).
    pub fn is_applying(&self) -> Result<bool> {
        Ok(self
            .lock
            .active_record()?
            .is_some_and(|record| record.phase == StagePhase::Applying))
    }

    /// Runs every status-check hook without changing anything.
    pub fn status_check(&self) -> Result<Vec<ValidationResult>> {
        let record = self.lock.active_record()?;
        let stage_dir = record
            .as_ref()
            .map(|r| self.dirs.stage_directory(&r.stage_id));
        self.run_hooks(
            StageEvent::StatusCheck,
            record.as_ref().map(|r| &r.stage_id),
            stage_dir.as_deref(),
            record.as_ref().map(|r| &r.metadata),
        )
    }

    /// The exclusion set a copy in `direction` would use right now.
    pub fn collect_exclusions(&self, direction: CopyDirection) -> Result<ExclusionSet> {
        let active_packages =
            PackageList::load(&self.config.project_root, &self.config.vendor_dir)?;
        let stage_dir = self
            .session
            .as_ref()
            .map(|s| s.stage_dir.as_path())
            .filter(|dir| dir.is_dir());
        let staged_packages = stage_dir
            .map(|dir| PackageList::load(dir, &self.config.vendor_dir))
            .transpose()?;
        let web_prefix = self.config.web_prefix();

        let ctx = ExclusionContext {
            direction,
            project_root: &self.config.project_root,
            stage_dir,
            web_prefix: web_prefix.as_deref(),
            vendor_dir: &self.config.vendor_dir,
            site: &self.config.site,
            core_packages: &self.config.core_packages,
            active_packages: &active_packages,
            staged_packages: staged_packages.as_ref(),
        };
        let mut set = self.exclusions.collect(&ctx)?;
        // The marker lives only in the live codebase; copy-back must not delete it.
        set.add_project_path(FAILURE_MARKER_FILE);
        Ok(set)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn current_stage(&self) -> Result<(StageId, PathBuf)> {
        self.session
            .as_ref()
            .map(|s| (s.stage_id.clone(), s.stage_dir.clone()))
            .ok_or(StageError::NoActiveStage)
    }

    fn set_session_phase(&mut self, phase: StagePhase) {
        if let Some(session) = self.session.as_mut() {
            session.phase = phase;
        }
    }

    fn expect_phase(&self, operation: &'static str, allowed: &[StagePhase]) -> Result<()> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(StageError::InvalidState { operation, phase })
        }
    }

    /// Re-claims the attached stage so the record (not memory) decides the
    /// phase and the owner.
    fn refresh_session(&mut self) -> Result<()> {
        let (stage_id, stage_dir) = self.current_stage()?;
        let record = self.lock.claim(&stage_id, &self.owner)?;
        self.session = Some(Session::from_record(record, stage_dir));
        Ok(())
    }

    fn release_quietly(&self, stage_id: &StageId) {
        if let Err(err) = self.lock.release(stage_id) {
            warn!(stage_id = %stage_id, error = %err, "Failed to release ownership record");
        }
    }

    fn sweep_orphans(&self) {
        match self.dirs.remove_orphans(None) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed orphaned stage directories"),
            Err(err) => warn!(error = %err, "Failed to remove orphaned stage directories"),
        }
    }

    fn warn_on_missing_requirements(
        &self,
        stage_dir: &Path,
        runtime: &BTreeMap<String, String>,
        dev: &BTreeMap<String, String>,
    ) {
        let composer_json = match ComposerJson::load(stage_dir) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "Could not read staged composer.json");
                return;
            }
        };
        for (section, packages) in [
            (RequirementSection::Require, runtime),
            (RequirementSection::RequireDev, dev),
        ] {
            for name in packages.keys() {
                if composer_json.requirement(section, name).is_none() {
                    warn!(
                        package = %name,
                        section = section.key(),
                        "Requested package missing from staged composer.json"
                    );
                }
            }
        }
    }

    fn fire_current(&self, event: StageEvent) -> Result<()> {
        let session = self.session.as_ref();
        self.fire(
            event,
            session.map(|s| &s.stage_id),
            session.map(|s| s.stage_dir.as_path()),
            session.map(|s| &s.metadata),
        )
    }

    /// Runs the hooks for `event` and turns error findings into a
    /// `ValidationError`.
    fn fire(
        &self,
        event: StageEvent,
        stage_id: Option<&StageId>,
        stage_dir: Option<&Path>,
        metadata: Option<&StageMetadata>,
    ) -> Result<()> {
        let results = self.run_hooks(event, stage_id, stage_dir, metadata)?;
        if events::overall_severity(&results) == Severity::Error {
            let err = ValidationError { event, results };
            warn!(event = %event, error = %err, "Validation failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn run_hooks(
        &self,
        event: StageEvent,
        stage_id: Option<&StageId>,
        stage_dir: Option<&Path>,
        metadata: Option<&StageMetadata>,
    ) -> Result<Vec<ValidationResult>> {
        let no_packages = PackageVersions::default();
        let ctx = HookContext {
            event,
            config: &self.config,
            policy: &self.policy,
            stage_id,
            stage_dir,
            desired: metadata.map_or(&no_packages, |m| &m.package_versions),
            metadata,
        };

        let mut results = Vec::new();
        for validator in &self.validators {
            let found = events::dispatch(validator.as_ref(), &ctx)?;
            for result in &found {
                if result.severity == Severity::Warning {
                    warn!(
                        event = %event,
                        validator = validator.name(),
                        messages = ?result.messages,
                        "Validation warning"
                    );
                }
            }
            results.extend(found);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoragePaths;
    use fs_err as fs;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        config: StageConfig,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(project.join("vendor")).unwrap();
        fs::write(project.join("composer.json"), "{\"require\":{}}").unwrap();
        let mut config = StageConfig::for_project(&project);
        config.staging_root = Some(tmp.path().join("stages"));
        config.state_dir = Some(tmp.path().join("state"));
        Fixture { tmp, config }
    }

    fn lifecycle(f: &Fixture, owner: &OwnerToken) -> StageLifecycle {
        StageLifecycle::new(f.config.clone(), UpdatePolicy::Extensions, owner.clone()).unwrap()
    }

    fn desired() -> PackageVersions {
        PackageVersions::new().with_runtime("drupal/token", "1.2.0")
    }

    struct Veto(StageEvent);

    impl StageValidator for Veto {
        fn name(&self) -> &'static str {
            "veto"
        }

        fn pre_create(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
            Ok(match self.0 {
                StageEvent::PreCreate => vec![ValidationResult::error(vec!["no".into()])],
                _ => Vec::new(),
            })
        }

        fn pre_destroy(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
            Ok(match self.0 {
                StageEvent::PreDestroy => vec![ValidationResult::error(vec!["keep".into()])],
                _ => Vec::new(),
            })
        }
    }

    #[test]
    fn begin_copies_and_records_phase() {
        let f = fixture();
        let owner = OwnerToken::generate();
        let mut stage = lifecycle(&f, &owner);
        assert!(stage.is_available().unwrap());

        let id = stage.begin(desired(), None).unwrap();
        assert_eq!(stage.phase(), StagePhase::Created);
        assert!(!stage.is_available().unwrap());
        assert!(stage.stage_directory().unwrap().join("composer.json").exists());
        assert_eq!(stage.package_versions().unwrap(), &desired());
        assert_eq!(stage.stage_id(), Some(&id));
    }

    #[test]
    fn pre_create_veto_leaves_nothing_behind() {
        let f = fixture();
        let mut stage =
            lifecycle(&f, &OwnerToken::generate()).with_validator(Veto(StageEvent::PreCreate));

        let err = stage.begin(desired(), None).unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        assert_eq!(stage.phase(), StagePhase::Available);
        assert!(stage.is_available().unwrap());
        assert!(!f.tmp.path().join("stages").exists()
            || fs::read_dir(f.tmp.path().join("stages")).unwrap().next().is_none());
    }

    #[test]
    fn invalid_request_rejected_before_lock() {
        let f = fixture();
        let mut stage = lifecycle(&f, &OwnerToken::generate());
        let err = stage.begin(PackageVersions::new(), None).unwrap_err();
        assert!(matches!(err, StageError::InvalidArgument(_)));
        assert!(stage.is_available().unwrap());
    }

    #[test]
    fn claim_by_owner_restores_session() {
        let f = fixture();
        let owner = OwnerToken::generate();
        let id = lifecycle(&f, &owner).begin(desired(), None).unwrap();

        let mut resumed = lifecycle(&f, &owner);
        let record = resumed.claim(&id).unwrap();
        assert_eq!(record.metadata.package_versions, desired());
        assert_eq!(resumed.phase(), StagePhase::Created);

        let mut stranger = lifecycle(&f, &OwnerToken::generate());
        assert!(matches!(
            stranger.claim(&id),
            Err(StageError::WrongOwner { .. })
        ));
    }

    #[test]
    fn apply_requires_staged_phase() {
        let f = fixture();
        let mut stage = lifecycle(&f, &OwnerToken::generate());
        assert!(matches!(stage.apply(None), Err(StageError::NoActiveStage)));

        stage.begin(desired(), None).unwrap();
        assert!(matches!(
            stage.apply(None),
            Err(StageError::InvalidState {
                phase: StagePhase::Created,
                ..
            })
        ));
    }

    #[test]
    fn destroy_respects_veto_unless_forced() {
        let f = fixture();
        let mut stage =
            lifecycle(&f, &OwnerToken::generate()).with_validator(Veto(StageEvent::PreDestroy));
        stage.begin(desired(), None).unwrap();

        assert!(stage.destroy(false, None).is_err());
        assert_eq!(stage.phase(), StagePhase::Created);

        stage.destroy(true, Some("operator cleanup")).unwrap();
        assert!(stage.is_available().unwrap());
        assert_eq!(stage.phase(), StagePhase::Available);
    }

    #[test]
    fn forced_destroy_from_fresh_process_needs_no_owner() {
        let f = fixture();
        let mut original = lifecycle(&f, &OwnerToken::generate());
        original.begin(desired(), None).unwrap();
        let stage_dir = original.stage_directory().unwrap().to_path_buf();

        let mut other = lifecycle(&f, &OwnerToken::generate());
        assert!(other.destroy(false, None).is_err());
        other.destroy(true, None).unwrap();
        assert!(!stage_dir.exists());
        assert!(other.is_available().unwrap());
    }

    #[test]
    fn applying_stage_cannot_be_destroyed_normally() {
        let f = fixture();
        let owner = OwnerToken::generate();
        let mut stage = lifecycle(&f, &owner);
        let id = stage.begin(desired(), None).unwrap();

        let lock = OwnershipLock::new(
            &StoragePaths::with_root(f.tmp.path().join("state")),
            &f.config.project_root,
            None,
        );
        lock.set_phase(&id, StagePhase::Applying).unwrap();
        assert!(stage.is_applying().unwrap());

        assert!(matches!(
            stage.destroy(false, None),
            Err(StageError::StageIsApplying { .. })
        ));
        stage.destroy(true, None).unwrap();
    }

    #[test]
    fn marker_blocks_begin() {
        let f = fixture();
        let mut stage = lifecycle(&f, &OwnerToken::generate());
        stage
            .failure_marker()
            .write(&StageId::from("old"), "previous crash")
            .unwrap();
        let err = stage.begin(desired(), None).unwrap_err();
        assert!(err.is_fatal());

        let results = stage.status_check().unwrap();
        assert_eq!(events::overall_severity(&results), Severity::Error);
    }

    #[test]
    fn exclusions_always_cover_marker() {
        let f = fixture();
        let stage = lifecycle(&f, &OwnerToken::generate());
        let set = stage.collect_exclusions(CopyDirection::BackToActive).unwrap();
        assert!(set.contains(FAILURE_MARKER_FILE));
    }
}
