//! Built-in validators.
//!
//! | Validator                     | Hooks                      |
//! |-------------------------------|----------------------------|
//! | `StageNotInActiveValidator`   | pre-create                 |
//! | `WritableDirectoriesValidator`| pre-create, status check   |
//! | `VersionPolicyValidator`      | pre-create                 |
//! | `LockFileValidator`           | pre-apply, status check    |
//! | `PendingChangesValidator`     | pre-apply                  |
//! | `StagedVersionsValidator`     | pre-apply                  |
//! | `AllowedChangesValidator`     | pre-apply                  |
//! | `FailureMarkerValidator`      | status check               |

use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::error::Result;
use crate::events::{HookContext, StageValidator, ValidationResult};
use crate::failure_marker::FailureMarker;
use crate::manifest::{self, normalize_version, ManifestDiff};
use crate::release::{AvailableReleases, ReleaseSelectionPolicy, ReleaseVersion};

/// The validators every lifecycle starts with.
pub fn default_validators() -> Vec<Box<dyn StageValidator>> {
    vec![
        Box::new(StageNotInActiveValidator),
        Box::new(WritableDirectoriesValidator),
        Box::new(LockFileValidator),
        Box::new(PendingChangesValidator),
        Box::new(StagedVersionsValidator),
        Box::new(AllowedChangesValidator),
        Box::new(FailureMarkerValidator),
    ]
}

fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Refuses a staging root inside the live codebase: the stage would copy
/// itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageNotInActiveValidator;

impl StageValidator for StageNotInActiveValidator {
    fn name(&self) -> &'static str {
        "stage_not_in_active"
    }

    fn pre_create(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let project_root = canonical_or_self(&ctx.config.project_root);
        let staging_root = ctx.config.staging_root();
        // The staging root may not exist yet; check its nearest existing ancestor.
        let staging_root = staging_root
            .ancestors()
            .find(|p| p.exists())
            .map(|existing| {
                let suffix = staging_root.strip_prefix(existing).unwrap_or(Path::new(""));
                canonical_or_self(existing).join(suffix)
            })
            .unwrap_or_else(|| staging_root.clone());

        if staging_root.starts_with(&project_root) {
            return Ok(vec![ValidationResult::error(vec![format!(
                "The staging root {} is inside the active directory {}",
                staging_root.display(),
                project_root.display()
            )])
            .with_summary("Stage directory is a subdirectory of the active directory.")]);
        }
        Ok(Vec::new())
    }
}

/// Project root and vendor directory must be writable.
#[derive(Debug, Clone, Copy, Default)]
pub struct WritableDirectoriesValidator;

impl WritableDirectoriesValidator {
    fn check(&self, ctx: &HookContext<'_>) -> Vec<ValidationResult> {
        let candidates = [ctx.config.project_root.clone(), ctx.config.vendor_path()];
        let messages = candidates
            .iter()
            .filter(|path| {
                fs::metadata(path)
                    .map(|meta| meta.permissions().readonly())
                    .unwrap_or(false)
            })
            .map(|path| format!("{} is not writable", path.display()))
            .collect::<Vec<_>>();

        if messages.is_empty() {
            Vec::new()
        } else {
            vec![ValidationResult::error(messages)
                .with_summary("The file system is not writable.")]
        }
    }
}

impl StageValidator for WritableDirectoriesValidator {
    fn name(&self) -> &'static str {
        "writable_directories"
    }

    fn pre_create(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(self.check(ctx))
    }

    fn status_check(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(self.check(ctx))
    }
}

/// The active composer.lock must not change while a stage exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockFileValidator;

impl LockFileValidator {
    fn check(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let Some(metadata) = ctx.metadata else {
            return Ok(Vec::new());
        };
        let current = manifest::lock_file_hash(&ctx.config.project_root)?;
        if current == metadata.lock_file_hash {
            return Ok(Vec::new());
        }
        let message = match (&metadata.lock_file_hash, &current) {
            (Some(_), None) => "The active lock file was removed after the stage was created",
            (None, Some(_)) => "An active lock file appeared after the stage was created",
            _ => "Unexpected changes were detected in the active lock file",
        };
        Ok(vec![ValidationResult::error(vec![format!(
            "{message}, which indicates that other modifications are being made to the codebase"
        )])])
    }
}

impl StageValidator for LockFileValidator {
    fn name(&self) -> &'static str {
        "lock_file"
    }

    fn pre_apply(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        self.check(ctx)
    }

    fn status_check(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        self.check(ctx)
    }
}

/// There is nothing to apply when active and staged manifests are identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingChangesValidator;

impl StageValidator for PendingChangesValidator {
    fn name(&self) -> &'static str {
        "pending_changes"
    }

    fn pre_apply(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let Some(staged) = ctx.staged_packages()? else {
            return Ok(Vec::new());
        };
        let active = ctx.active_packages()?;
        if ManifestDiff::between(&active, &staged).is_empty() {
            return Ok(vec![ValidationResult::error(vec![
                "There are no pending changes to apply".to_string(),
            ])]);
        }
        Ok(Vec::new())
    }
}

/// Every requested package must be staged at exactly the requested version.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedVersionsValidator;

impl StageValidator for StagedVersionsValidator {
    fn name(&self) -> &'static str {
        "staged_versions"
    }

    fn pre_apply(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let Some(staged) = ctx.staged_packages()? else {
            return Ok(Vec::new());
        };

        let messages = ctx
            .desired
            .iter()
            .filter_map(|(name, wanted)| match staged.get(name) {
                None => Some(format!(
                    "{name} was expected to be staged at {wanted} but it is not installed in \
                     the stage"
                )),
                Some(entry) if normalize_version(&entry.version) != normalize_version(wanted) => {
                    Some(format!(
                        "{name} was expected to be staged at {wanted} but {} was staged",
                        entry.version
                    ))
                }
                Some(_) => None,
            })
            .collect::<Vec<_>>();

        if messages.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ValidationResult::error(messages)
            .with_summary("The update cannot proceed because the staged versions differ.")])
    }
}

/// Only the requested projects may change among watched package types.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowedChangesValidator;

impl StageValidator for AllowedChangesValidator {
    fn name(&self) -> &'static str {
        "allowed_changes"
    }

    fn pre_apply(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let Some(staged) = ctx.staged_packages()? else {
            return Ok(Vec::new());
        };
        let active = ctx.active_packages()?;
        let diff = ManifestDiff::between(&active, &staged);
        let watched = |package_type: &str| {
            ctx.config
                .watched_package_types
                .iter()
                .any(|t| t == package_type)
        };

        let mut messages = Vec::new();
        for (name, entry) in &diff.added {
            if watched(&entry.package_type) && !ctx.desired.contains(name) {
                messages.push(format!("project {name} was installed"));
            }
        }
        for (name, entry) in &diff.removed {
            if watched(&entry.package_type) && !ctx.desired.contains(name) {
                messages.push(format!("project {name} was removed"));
            }
        }
        for (name, change) in &diff.changed {
            let package_type = active
                .get(name)
                .map(|entry| entry.package_type.as_str())
                .unwrap_or_default();
            if watched(package_type) && !ctx.desired.contains(name) {
                messages.push(format!(
                    "project {name} from {} to {}",
                    change.from, change.to
                ));
            }
        }

        if messages.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ValidationResult::error(messages)
            .with_summary("The update cannot proceed because unrequested projects changed.")])
    }
}

/// Checks the requested core version against the release selection rules.
#[derive(Debug, Clone)]
pub struct VersionPolicyValidator {
    releases: AvailableReleases,
}

impl VersionPolicyValidator {
    pub fn new(releases: AvailableReleases) -> Self {
        Self { releases }
    }
}

impl StageValidator for VersionPolicyValidator {
    fn name(&self) -> &'static str {
        "version_policy"
    }

    fn pre_create(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let Some(mode) = ctx.policy.selection_mode() else {
            return Ok(Vec::new());
        };
        let active = ctx.active_packages()?;
        let policy = ReleaseSelectionPolicy::new(mode);

        let mut results = Vec::new();
        for (name, wanted) in ctx.desired.iter() {
            let Some(installed) = active.get(name) else {
                results.push(ValidationResult::error(vec![format!(
                    "Cannot determine the installed version of {name}"
                )]));
                continue;
            };
            let installed_version = ReleaseVersion::parse(&installed.version);
            let target_version = ReleaseVersion::parse(wanted);
            let (Some(installed_version), Some(target_version)) =
                (installed_version, target_version)
            else {
                results.push(ValidationResult::error(vec![format!(
                    "Cannot compare versions {} and {wanted} of {name}",
                    installed.version
                )]));
                continue;
            };
            let messages = policy.validate(&installed_version, &target_version, &self.releases);
            if !messages.is_empty() {
                results.push(ValidationResult::error(messages));
            }
        }
        Ok(results)
    }
}

/// Reports a leftover failure marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureMarkerValidator;

impl StageValidator for FailureMarkerValidator {
    fn name(&self) -> &'static str {
        "failure_marker"
    }

    fn status_check(&self, ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        let marker = FailureMarker::new(ctx.config.failure_marker_path());
        match marker.assert_absent() {
            Ok(()) => Ok(Vec::new()),
            Err(err) => Ok(vec![ValidationResult::error(vec![err.to_string()])]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::events::{Severity, StageEvent};
    use crate::lock::{StageId, StageMetadata};
    use crate::release::{ReleaseInfo, UnattendedMode};
    use crate::requirement::{PackageVersions, UpdatePolicy};
    use tempfile::TempDir;

    fn write_installed(root: &Path, packages: &[(&str, &str, &str)]) {
        let dir = root.join("vendor/composer");
        fs::create_dir_all(&dir).unwrap();
        let packages = packages
            .iter()
            .map(|(name, version, package_type)| {
                serde_json::json!({
                    "name": name,
                    "version": version,
                    "type": package_type,
                    "install-path": format!("../{name}"),
                })
            })
            .collect::<Vec<_>>();
        let doc = serde_json::json!({ "packages": packages, "dev-package-names": [] });
        fs::write(dir.join("installed.json"), doc.to_string()).unwrap();
    }

    struct Fixture {
        _tmp: TempDir,
        config: StageConfig,
        stage_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let active = tmp.path().join("active");
        let stage_dir = tmp.path().join("stage");
        fs::create_dir_all(&active).unwrap();
        fs::create_dir_all(&stage_dir).unwrap();
        let mut config = StageConfig::for_project(&active);
        config.staging_root = Some(tmp.path().join("stages"));
        Fixture {
            _tmp: tmp,
            config,
            stage_dir,
        }
    }

    fn ctx<'a>(
        fixture: &'a Fixture,
        event: StageEvent,
        policy: &'a UpdatePolicy,
        desired: &'a PackageVersions,
        metadata: Option<&'a StageMetadata>,
        stage_id: Option<&'a StageId>,
    ) -> HookContext<'a> {
        HookContext {
            event,
            config: &fixture.config,
            policy,
            stage_id,
            stage_dir: Some(&fixture.stage_dir),
            desired,
            metadata,
        }
    }

    #[test]
    fn staging_root_inside_project_is_rejected() {
        let mut f = fixture();
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new();
        assert!(StageNotInActiveValidator
            .pre_create(&ctx(&f, StageEvent::PreCreate, &policy, &desired, None, None))
            .unwrap()
            .is_empty());

        f.config.staging_root = Some(f.config.project_root.join("stages"));
        let results = StageNotInActiveValidator
            .pre_create(&ctx(&f, StageEvent::PreCreate, &policy, &desired, None, None))
            .unwrap();
        assert_eq!(results[0].severity, Severity::Error);
    }

    #[test]
    fn staged_version_mismatch_names_everything() {
        let f = fixture();
        write_installed(&f.stage_dir, &[("drupal/a", "1.5.0", "drupal-module")]);
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new().with_runtime("drupal/a", "2.0.0");

        let results = StagedVersionsValidator
            .pre_apply(&ctx(&f, StageEvent::PreApply, &policy, &desired, None, None))
            .unwrap();
        let message = &results[0].messages[0];
        assert!(message.contains("drupal/a"));
        assert!(message.contains("2.0.0"));
        assert!(message.contains("1.5.0"));
    }

    #[test]
    fn staged_version_match_passes() {
        let f = fixture();
        write_installed(&f.stage_dir, &[("drupal/a", "v2.0.0", "drupal-module")]);
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new().with_runtime("drupal/a", "2.0.0");
        assert!(StagedVersionsValidator
            .pre_apply(&ctx(&f, StageEvent::PreApply, &policy, &desired, None, None))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn no_pending_changes_is_an_error() {
        let f = fixture();
        write_installed(&f.config.project_root, &[("drupal/a", "1.0.0", "drupal-module")]);
        write_installed(&f.stage_dir, &[("drupal/a", "1.0.0", "drupal-module")]);
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new();
        let results = PendingChangesValidator
            .pre_apply(&ctx(&f, StageEvent::PreApply, &policy, &desired, None, None))
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn unrequested_project_changes_are_rejected() {
        let f = fixture();
        write_installed(
            &f.config.project_root,
            &[
                ("drupal/a", "1.0.0", "drupal-module"),
                ("drupal/b", "1.0.0", "drupal-module"),
                ("psr/log", "1.0.0", "library"),
            ],
        );
        write_installed(
            &f.stage_dir,
            &[
                ("drupal/a", "2.0.0", "drupal-module"),
                ("drupal/b", "1.1.0", "drupal-module"),
                ("psr/log", "3.0.0", "library"),
                ("drupal/c", "1.0.0", "drupal-theme"),
            ],
        );
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new().with_runtime("drupal/a", "2.0.0");
        let results = AllowedChangesValidator
            .pre_apply(&ctx(&f, StageEvent::PreApply, &policy, &desired, None, None))
            .unwrap();
        let messages = &results[0].messages;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.contains("drupal/b from 1.0.0 to 1.1.0")));
        assert!(messages.iter().any(|m| m.contains("drupal/c was installed")));
    }

    #[test]
    fn lock_file_drift_detected() {
        let f = fixture();
        fs::write(f.config.project_root.join("composer.lock"), "{}").unwrap();
        let metadata = StageMetadata {
            package_versions: PackageVersions::new(),
            lock_file_hash: manifest::lock_file_hash(&f.config.project_root).unwrap(),
        };
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new();
        let id = StageId::from("abc");
        let check = |f: &Fixture| {
            LockFileValidator
                .pre_apply(&ctx(f, StageEvent::PreApply, &policy, &desired, Some(&metadata), Some(&id)))
                .unwrap()
        };
        assert!(check(&f).is_empty());

        fs::write(f.config.project_root.join("composer.lock"), "{\"changed\":1}").unwrap();
        let results = check(&f);
        assert!(results[0].messages[0].contains("Unexpected changes"));
    }

    #[test]
    fn version_policy_applies_release_rules() {
        let f = fixture();
        write_installed(&f.config.project_root, &[("drupal/core", "10.1.0", "drupal-core")]);
        let releases = AvailableReleases {
            releases: vec![
                ReleaseInfo { version: "11.0.0".into(), security: false },
                ReleaseInfo { version: "10.1.1".into(), security: true },
            ],
            supported_branches: vec!["10.1.".into()],
        };
        let validator = VersionPolicyValidator::new(releases);
        let policy = UpdatePolicy::CoreUnattended(UnattendedMode::Security);

        let ok = PackageVersions::new().with_runtime("drupal/core", "10.1.1");
        assert!(validator
            .pre_create(&ctx(&f, StageEvent::PreCreate, &policy, &ok, None, None))
            .unwrap()
            .is_empty());

        let major = PackageVersions::new().with_runtime("drupal/core", "11.0.0");
        let results = validator
            .pre_create(&ctx(&f, StageEvent::PreCreate, &policy, &major, None, None))
            .unwrap();
        assert!(results[0].messages[0].contains("major version"));
    }

    #[test]
    fn failure_marker_reported_on_status_check() {
        let f = fixture();
        let policy = UpdatePolicy::Extensions;
        let desired = PackageVersions::new();
        let context = ctx(&f, StageEvent::StatusCheck, &policy, &desired, None, None);
        assert!(FailureMarkerValidator.status_check(&context).unwrap().is_empty());

        FailureMarker::new(f.config.failure_marker_path())
            .write(&StageId::from("abc"), "boom")
            .unwrap();
        let results = FailureMarkerValidator.status_check(&context).unwrap();
        assert_eq!(results[0].severity, Severity::Error);
    }
}
