use tracing::debug;

use super::{AvailableReleases, ReleaseVersion, Stability, TargetRelease, UnattendedMode};

/// Named version rules. Each one either passes (no messages) or rejects a
/// candidate with one or more messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRule {
    ForbidDevSnapshot,
    SupportedBranchInstalled,
    MajorVersionMatch,
    ForbidMinorUpdates,
    ForbidDowngrade,
    StableReleaseInstalled,
    TargetVersionStable,
    TargetSecurityRelease,
    TargetVersionInstallable,
}

pub const INTERACTIVE_RULES: [VersionRule; 4] = [
    VersionRule::ForbidDevSnapshot,
    VersionRule::MajorVersionMatch,
    VersionRule::ForbidDowngrade,
    VersionRule::TargetVersionInstallable,
];

pub const UNATTENDED_RULES: [VersionRule; 9] = [
    VersionRule::ForbidDevSnapshot,
    VersionRule::SupportedBranchInstalled,
    VersionRule::MajorVersionMatch,
    VersionRule::ForbidMinorUpdates,
    VersionRule::ForbidDowngrade,
    VersionRule::StableReleaseInstalled,
    VersionRule::TargetVersionStable,
    VersionRule::TargetSecurityRelease,
    VersionRule::TargetVersionInstallable,
];

impl VersionRule {
    pub fn label(self) -> &'static str {
        match self {
            Self::ForbidDevSnapshot => "forbid dev snapshot",
            Self::SupportedBranchInstalled => "supported branch installed",
            Self::MajorVersionMatch => "major version match",
            Self::ForbidMinorUpdates => "forbid minor updates",
            Self::ForbidDowngrade => "forbid downgrade",
            Self::StableReleaseInstalled => "stable release installed",
            Self::TargetVersionStable => "target version stable",
            Self::TargetSecurityRelease => "target security release",
            Self::TargetVersionInstallable => "target version installable",
        }
    }

    fn check(
        self,
        mode: SelectionMode,
        installed: &ReleaseVersion,
        target: &ReleaseVersion,
        releases: &AvailableReleases,
    ) -> Vec<String> {
        let failed = match self {
            Self::ForbidDevSnapshot => installed.is_dev().then(|| {
                format!("Cannot update from a dev snapshot (installed version is {installed})")
            }),
            Self::SupportedBranchInstalled => (!releases.is_supported_branch(installed)).then(|| {
                format!(
                    "Cannot update automatically from {installed} because its branch {} is no \
                     longer supported",
                    installed.branch()
                )
            }),
            Self::MajorVersionMatch => (installed.major != target.major).then(|| {
                format!(
                    "Cannot update from {installed} to {target} because major version updates \
                     are not supported"
                )
            }),
            Self::ForbidMinorUpdates => (installed.minor != target.minor).then(|| {
                format!(
                    "Cannot update automatically from {installed} to {target} because minor \
                     version updates must be done by hand"
                )
            }),
            Self::ForbidDowngrade => (target < installed).then(|| {
                format!(
                    "Update version {target} is lower than {installed}, downgrading is not \
                     supported"
                )
            }),
            Self::StableReleaseInstalled => {
                (installed.stability() != Stability::Stable).then(|| {
                    format!(
                        "Cannot update automatically from {installed} because it is not a \
                         stable version"
                    )
                })
            }
            Self::TargetVersionStable => (target.stability() != Stability::Stable).then(|| {
                format!("Cannot update automatically to {target} because it is not a stable version")
            }),
            Self::TargetSecurityRelease => {
                let security_only = mode == SelectionMode::Unattended(UnattendedMode::Security);
                let is_security = releases.get(target).is_some_and(|info| info.security);
                (security_only && !is_security).then(|| {
                    format!(
                        "Cannot update automatically to {target} because it is not a security \
                         release"
                    )
                })
            }
            Self::TargetVersionInstallable => {
                let installable = releases
                    .installable_after(installed)
                    .iter()
                    .any(|candidate| candidate == target);
                (!installable).then(|| {
                    format!("Cannot update to {target} because it is not an available release")
                })
            }
        };
        failed.into_iter().collect()
    }
}

/// Whether selection is for a person or for cron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Interactive,
    Unattended(UnattendedMode),
}

/// A candidate that a rule turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub version: String,
    pub rule: VersionRule,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionOutcome {
    pub target: Option<TargetRelease>,
    pub rejections: Vec<Rejection>,
}

/// Ordered, short-circuiting rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSelectionPolicy {
    mode: SelectionMode,
}

impl ReleaseSelectionPolicy {
    pub fn new(mode: SelectionMode) -> Self {
        Self { mode }
    }

    pub fn interactive() -> Self {
        Self::new(SelectionMode::Interactive)
    }

    pub fn unattended(mode: UnattendedMode) -> Self {
        Self::new(SelectionMode::Unattended(mode))
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn rules(&self) -> &'static [VersionRule] {
        match self.mode {
            SelectionMode::Interactive => &INTERACTIVE_RULES,
            SelectionMode::Unattended(_) => &UNATTENDED_RULES,
        }
    }

    pub fn policy_order(&self) -> Vec<&'static str> {
        self.rules().iter().map(|rule| rule.label()).collect()
    }

    /// Messages of the first rule that rejects `target`; empty if every rule
    /// passes.
    pub fn validate(
        &self,
        installed: &ReleaseVersion,
        target: &ReleaseVersion,
        releases: &AvailableReleases,
    ) -> Vec<String> {
        self.first_failure(installed, target, releases)
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }

    fn first_failure(
        &self,
        installed: &ReleaseVersion,
        target: &ReleaseVersion,
        releases: &AvailableReleases,
    ) -> Option<(VersionRule, Vec<String>)> {
        if self.mode == SelectionMode::Unattended(UnattendedMode::Disabled) {
            return Some((
                VersionRule::TargetVersionInstallable,
                vec!["Unattended updates are disabled".to_string()],
            ));
        }
        self.rules().iter().find_map(|rule| {
            let messages = rule.check(self.mode, installed, target, releases);
            (!messages.is_empty()).then_some((*rule, messages))
        })
    }

    /// Picks the newest installable release that passes every rule.
    pub fn select_target(
        &self,
        installed: &ReleaseVersion,
        releases: &AvailableReleases,
    ) -> SelectionOutcome {
        let mut outcome = SelectionOutcome::default();
        for candidate in releases.installable_after(installed) {
            match self.first_failure(installed, &candidate, releases) {
                None => {
                    outcome.target = Some(TargetRelease::new(candidate, releases));
                    break;
                }
                Some((rule, messages)) => {
                    debug!(
                        candidate = %candidate,
                        rule = rule.label(),
                        "Release candidate rejected"
                    );
                    outcome.rejections.push(Rejection {
                        version: candidate.to_string(),
                        rule,
                        messages,
                    });
                }
            }
        }
        outcome
    }
}
