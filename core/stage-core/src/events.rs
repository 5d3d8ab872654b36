//! Extensibility points around each lifecycle transition.
//!
//! Validators are plain objects registered on a lifecycle in order. Each
//! one implements only the hooks it cares about; the rest default to "no
//! findings". A hook reports findings by returning [`ValidationResult`]s and
//! reports faults (I/O, malformed manifests) through `Err`.
//!
//! After every validator has run, the lifecycle collapses the findings: any
//! `Error` result on a pre-hook vetoes the transition and comes back to the
//! caller as a [`ValidationError`] carrying every result of that event.

use std::fmt;
use std::path::Path;

use crate::config::StageConfig;
use crate::error::Result;
use crate::lock::{StageId, StageMetadata};
use crate::manifest::PackageList;
use crate::requirement::{PackageVersions, UpdatePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageEvent {
    PreCreate,
    PostCreate,
    PreRequire,
    PostRequire,
    PreApply,
    PostApply,
    PreDestroy,
    PostDestroy,
    StatusCheck,
}

impl StageEvent {
    pub fn is_pre(self) -> bool {
        matches!(
            self,
            StageEvent::PreCreate
                | StageEvent::PreRequire
                | StageEvent::PreApply
                | StageEvent::PreDestroy
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageEvent::PreCreate => "pre-create",
            StageEvent::PostCreate => "post-create",
            StageEvent::PreRequire => "pre-require",
            StageEvent::PostRequire => "post-require",
            StageEvent::PreApply => "pre-apply",
            StageEvent::PostApply => "post-apply",
            StageEvent::PreDestroy => "pre-destroy",
            StageEvent::PostDestroy => "post-destroy",
            StageEvent::StatusCheck => "status check",
        }
    }
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapsed severity of a finding. `Info` is the "OK" level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// One group of messages with a single severity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub severity: Severity,
    pub summary: Option<String>,
    pub messages: Vec<String>,
}

impl ValidationResult {
    pub fn error(messages: Vec<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: None,
            messages,
        }
    }

    pub fn warning(messages: Vec<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: None,
            messages,
        }
    }

    pub fn info(messages: Vec<String>) -> Self {
        Self {
            severity: Severity::Info,
            summary: None,
            messages,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Highest severity among `results`, `Info` when empty.
pub fn overall_severity(results: &[ValidationResult]) -> Severity {
    results
        .iter()
        .map(|result| result.severity)
        .max()
        .unwrap_or(Severity::Info)
}

/// Aggregated findings that vetoed (or followed) a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub event: StageEvent,
    pub results: Vec<ValidationResult>,
}

impl ValidationError {
    /// Every message of every error result, summaries first.
    pub fn messages(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|result| result.severity == Severity::Error)
            .flat_map(|result| {
                result
                    .summary
                    .as_deref()
                    .into_iter()
                    .chain(result.messages.iter().map(String::as_str))
            })
            .collect()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed during {}: ", self.event)?;
        f.write_str(&self.messages().join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// What a validator may look at.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub event: StageEvent,
    pub config: &'a StageConfig,
    pub policy: &'a UpdatePolicy,
    /// Absent for status checks with no stage.
    pub stage_id: Option<&'a StageId>,
    pub stage_dir: Option<&'a Path>,
    pub desired: &'a PackageVersions,
    pub metadata: Option<&'a StageMetadata>,
}

impl<'a> HookContext<'a> {
    /// Installed packages of the live codebase.
    pub fn active_packages(&self) -> Result<PackageList> {
        PackageList::load(&self.config.project_root, &self.config.vendor_dir)
    }

    /// Installed packages of the stage, if one exists.
    pub fn staged_packages(&self) -> Result<Option<PackageList>> {
        self.stage_dir
            .map(|dir| PackageList::load(dir, &self.config.vendor_dir))
            .transpose()
    }
}

/// Listener with one optional hook per event.
pub trait StageValidator {
    fn name(&self) -> &'static str;

    fn pre_create(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn post_create(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn pre_require(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn post_require(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn pre_apply(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn post_apply(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn pre_destroy(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn post_destroy(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }

    fn status_check(&self, _ctx: &HookContext<'_>) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }
}

/// Routes `ctx.event` to the matching hook.
pub fn dispatch(
    validator: &dyn StageValidator,
    ctx: &HookContext<'_>,
) -> Result<Vec<ValidationResult>> {
    match ctx.event {
        StageEvent::PreCreate => validator.pre_create(ctx),
        StageEvent::PostCreate => validator.post_create(ctx),
        StageEvent::PreRequire => validator.pre_require(ctx),
        StageEvent::PostRequire => validator.post_require(ctx),
        StageEvent::PreApply => validator.pre_apply(ctx),
        StageEvent::PostApply => validator.post_apply(ctx),
        StageEvent::PreDestroy => validator.pre_destroy(ctx),
        StageEvent::PostDestroy => validator.post_destroy(ctx),
        StageEvent::StatusCheck => validator.status_check(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_severity_is_max() {
        assert_eq!(overall_severity(&[]), Severity::Info);
        let results = vec![
            ValidationResult::warning(vec!["w".into()]),
            ValidationResult::error(vec!["e".into()]),
        ];
        assert_eq!(overall_severity(&results), Severity::Error);
    }

    #[test]
    fn error_display_lists_error_messages_only() {
        let err = ValidationError {
            event: StageEvent::PreApply,
            results: vec![
                ValidationResult::warning(vec!["ignored".into()]),
                ValidationResult::error(vec!["first".into(), "second".into()])
                    .with_summary("Two problems"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Validation failed during pre-apply: Two problems; first; second"
        );
    }

    #[test]
    fn only_pre_events_veto() {
        assert!(StageEvent::PreCreate.is_pre());
        assert!(!StageEvent::PostApply.is_pre());
        assert!(!StageEvent::StatusCheck.is_pre());
    }
}
