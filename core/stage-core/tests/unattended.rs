//! Unattended core updates end to end.

mod common;

use common::{project_with, read, FakeComposer};
use stage_core::{
    AvailableReleases, OwnerToken, RecordingNotifier, ReleaseInfo, RunOutcome, SkipReason,
    StageError, StageLifecycle, UnattendedMode, UnattendedRunner, UpdatePolicy,
};

fn releases() -> AvailableReleases {
    AvailableReleases {
        releases: vec![
            ReleaseInfo {
                version: "10.2.0".to_string(),
                security: false,
            },
            ReleaseInfo {
                version: "10.1.2".to_string(),
                security: true,
            },
            ReleaseInfo {
                version: "10.1.1".to_string(),
                security: false,
            },
        ],
        supported_branches: vec!["10.1.".to_string(), "10.2.".to_string()],
    }
}

fn core_lifecycle(project: &common::Project, composer: FakeComposer) -> StageLifecycle {
    StageLifecycle::new(
        project.config.clone(),
        UpdatePolicy::CoreUnattended(UnattendedMode::Security),
        OwnerToken::generate(),
    )
    .unwrap()
    .with_stager(composer)
}

#[test]
fn test_security_release_is_applied() {
    let project = project_with(&[("drupal/core", "10.1.0", "drupal-core")]);
    let notifier = RecordingNotifier::default();
    let mut runner =
        UnattendedRunner::new(core_lifecycle(&project, FakeComposer::new()), &notifier).unwrap();

    match runner.run(&releases()).unwrap() {
        RunOutcome::Updated { package, from, to, .. } => {
            assert_eq!(package, "drupal/core");
            assert_eq!(from, "10.1.0");
            assert_eq!(to, "10.1.2");
        }
        other => panic!("expected an update, got {other:?}"),
    }

    assert_eq!(read(project.root(), "vendor/drupal/core/VERSION"), "10.1.2");
    assert!(runner.lifecycle().is_available().unwrap());
    assert_eq!(notifier.successes(), vec!["drupal/core 10.1.0 -> 10.1.2"]);
}

#[test]
fn test_failed_validation_destroys_stage_and_notifies() {
    let project = project_with(&[("drupal/core", "10.1.0", "drupal-core")]);
    let notifier = RecordingNotifier::default();
    let composer = FakeComposer::new().resolving("drupal/core", "10.1.1");
    let mut runner =
        UnattendedRunner::new(core_lifecycle(&project, composer), &notifier).unwrap();

    let err = runner.run(&releases()).unwrap_err();
    assert!(matches!(err, StageError::Validation(_)));
    assert!(runner.lifecycle().is_available().unwrap());
    assert_eq!(notifier.failures().len(), 1);
    assert_eq!(read(project.root(), "vendor/drupal/core/VERSION"), "10.1.0");
}

#[test]
fn test_active_stage_is_skipped() {
    let project = project_with(&[("drupal/core", "10.1.0", "drupal-core")]);
    let mut other = StageLifecycle::new(
        project.config.clone(),
        UpdatePolicy::Extensions,
        OwnerToken::generate(),
    )
    .unwrap();
    other
        .begin(
            stage_core::PackageVersions::new().with_runtime("drupal/token", "1.0.0"),
            None,
        )
        .unwrap();

    let notifier = RecordingNotifier::default();
    let mut runner =
        UnattendedRunner::new(core_lifecycle(&project, FakeComposer::new()), &notifier).unwrap();
    assert_eq!(
        runner.run(&releases()).unwrap(),
        RunOutcome::Skipped(SkipReason::StageActive)
    );
    assert!(notifier.failures().is_empty());
}

#[test]
fn test_no_qualifying_release_is_skipped() {
    let project = project_with(&[("drupal/core", "10.1.2", "drupal-core")]);
    let notifier = RecordingNotifier::default();
    let mut runner =
        UnattendedRunner::new(core_lifecycle(&project, FakeComposer::new()), &notifier).unwrap();
    assert_eq!(
        runner.run(&releases()).unwrap(),
        RunOutcome::Skipped(SkipReason::NoTarget)
    );
}
