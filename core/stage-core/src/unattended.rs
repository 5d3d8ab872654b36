//! Unattended (cron) core updates.
//!
//! One run decides whether to update, picks the target release and drives a
//! lifecycle through every transition. Anything that means "someone else is
//! busy" is a skip, not a failure. Real failures are reported through a
//! [`Notifier`] and the stage is force-destroyed, except after a failed
//! copy-back: that stage is the only record of what was being applied.

use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::error::{Result, StageError};
use crate::lifecycle::StageLifecycle;
use crate::lock::StageId;
use crate::release::{AvailableReleases, ReleaseSelectionPolicy, ReleaseVersion, UnattendedMode};
use crate::requirement::{PackageVersions, UpdatePolicy};

/// Receives the results of unattended runs.
pub trait Notifier {
    fn update_succeeded(&self, _package: &str, _from: &str, _to: &str) {}

    fn update_failed(&self, error: &StageError);
}

/// Logs notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn update_succeeded(&self, package: &str, from: &str, to: &str) {
        info!(package, from, to, "Unattended update succeeded");
    }

    fn update_failed(&self, error: &StageError) {
        error!(error = %error, fatal = error.is_fatal(), "Unattended update failed");
    }
}

/// Collects notifications in memory. Useful for callers that render the
/// result themselves.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<String>>,
    successes: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn successes(&self) -> Vec<String> {
        self.successes.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn update_succeeded(&self, package: &str, from: &str, to: &str) {
        if let Ok(mut successes) = self.successes.lock() {
            successes.push(format!("{package} {from} -> {to}"));
        }
    }

    fn update_failed(&self, error: &StageError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(error.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// A copy-back is in progress (or died) elsewhere.
    Applying,
    /// Another stage owns the staging area.
    StageActive,
    CoreNotInstalled,
    NoTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Skipped(SkipReason),
    Updated {
        stage_id: StageId,
        package: String,
        from: String,
        to: String,
    },
}

pub struct UnattendedRunner<'n> {
    lifecycle: StageLifecycle,
    mode: UnattendedMode,
    notifier: &'n dyn Notifier,
}

impl<'n> UnattendedRunner<'n> {
    /// `lifecycle` must have been built with an unattended core policy.
    pub fn new(lifecycle: StageLifecycle, notifier: &'n dyn Notifier) -> Result<Self> {
        let mode = match lifecycle.policy() {
            UpdatePolicy::CoreUnattended(mode) => *mode,
            other => {
                return Err(StageError::InvalidArgument(format!(
                    "Unattended runs need an unattended core policy, not {other:?}"
                )))
            }
        };
        Ok(Self {
            lifecycle,
            mode,
            notifier,
        })
    }

    pub fn lifecycle(&self) -> &StageLifecycle {
        &self.lifecycle
    }

    pub fn run(&mut self, releases: &AvailableReleases) -> Result<RunOutcome> {
        if self.mode == UnattendedMode::Disabled {
            info!("Unattended updates are disabled");
            return Ok(RunOutcome::Skipped(SkipReason::Disabled));
        }
        if let Err(err) = self.lifecycle.failure_marker().assert_absent() {
            self.notifier.update_failed(&err);
            return Err(err);
        }
        if self.lifecycle.is_applying()? {
            info!("Skipping unattended update: another update is being applied");
            return Ok(RunOutcome::Skipped(SkipReason::Applying));
        }
        if !self.lifecycle.is_available()? {
            info!("Skipping unattended update: another stage is in use");
            return Ok(RunOutcome::Skipped(SkipReason::StageActive));
        }

        let active = self.lifecycle.active_manifest()?;
        let installed = self
            .lifecycle
            .config()
            .core_packages
            .iter()
            .find_map(|name| active.get(name));
        let Some(installed) = installed else {
            warn!("Skipping unattended update: no core package is installed");
            return Ok(RunOutcome::Skipped(SkipReason::CoreNotInstalled));
        };
        let package = installed.name.clone();
        let from = installed.version.clone();

        let Some(installed_version) = ReleaseVersion::parse(&from) else {
            warn!(version = %from, "Skipping unattended update: installed version is not a release");
            return Ok(RunOutcome::Skipped(SkipReason::NoTarget));
        };
        let outcome =
            ReleaseSelectionPolicy::unattended(self.mode).select_target(&installed_version, releases);
        let Some(target) = outcome.target else {
            info!(
                installed = %installed_version,
                rejected = outcome.rejections.len(),
                "No release qualifies for an unattended update"
            );
            return Ok(RunOutcome::Skipped(SkipReason::NoTarget));
        };
        let to = target.version.to_string();

        match self.update(&package, &to) {
            Ok(stage_id) => {
                self.notifier.update_succeeded(&package, &from, &to);
                Ok(RunOutcome::Updated {
                    stage_id,
                    package,
                    from,
                    to,
                })
            }
            Err(err) => Err(self.handle_failure(err)),
        }
    }

    fn update(&mut self, package: &str, version: &str) -> Result<StageId> {
        let desired = PackageVersions::new().with_runtime(package, version);
        let runtime = desired.runtime.clone();

        let stage_id = self.lifecycle.begin(desired, None)?;
        self.lifecycle.require(runtime, Default::default(), None)?;
        self.lifecycle.apply(None)?;
        self.lifecycle.post_apply(None)?;
        self.lifecycle.destroy(false, None)?;
        Ok(stage_id)
    }

    fn handle_failure(&mut self, err: StageError) -> StageError {
        self.notifier.update_failed(&err);

        let keep_stage = matches!(err, StageError::ApplyFailed { .. });
        if keep_stage {
            warn!("Keeping the stage after a failed copy-back");
        } else if self.lifecycle.stage_id().is_some() {
            if let Err(cleanup) = self
                .lifecycle
                .destroy(true, Some("Unattended update failed"))
            {
                warn!(error = %cleanup, "Failed to destroy stage after unattended failure");
            }
        }
        err
    }
}
