//! Release metadata and target version selection.
//!
//! Available releases come from an external feed (a JSON file for the CLI).
//! Nothing here touches the filesystem pipeline: selection is a pure
//! function of the installed version, the feed and the unattended mode.

mod policy;

pub use policy::{
    ReleaseSelectionPolicy, Rejection, SelectionMode, SelectionOutcome, VersionRule,
    INTERACTIVE_RULES, UNATTENDED_RULES,
};

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use fs_err as fs;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::manifest::normalize_version;

/// `major.minor.patch` with an optional pre-release suffix, or a branch
/// snapshot like `10.1.x-dev`.
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(?:(\d+)(?:-([0-9A-Za-z.]+))?|(x)-dev)$").unwrap()
});

/// How unattended (cron) updates behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattendedMode {
    Disabled,
    /// Only security releases within the installed minor.
    #[default]
    Security,
    /// Any patch release within the installed minor.
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    PreRelease,
    Dev,
}

/// A parsed release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseVersion {
    pub major: u64,
    pub minor: u64,
    /// `None` for branch snapshots.
    pub patch: Option<u64>,
    /// Pre-release suffix such as `beta1` or `rc2`.
    pub pre_release: Option<String>,
    raw: String,
}

impl ReleaseVersion {
    pub fn parse(version: &str) -> Option<Self> {
        let normalized = normalize_version(version);
        let caps = VERSION_RE.captures(&normalized)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = match caps.get(3) {
            Some(m) => Some(m.as_str().parse().ok()?),
            None => None,
        };
        Some(Self {
            major,
            minor,
            patch,
            pre_release: caps.get(4).map(|m| m.as_str().to_string()),
            raw: normalized,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_dev(&self) -> bool {
        self.patch.is_none()
    }

    pub fn stability(&self) -> Stability {
        if self.is_dev() {
            Stability::Dev
        } else if self.pre_release.is_some() {
            Stability::PreRelease
        } else {
            Stability::Stable
        }
    }

    /// Branch key, `major.minor.`, the form used by supported-branch lists.
    pub fn branch(&self) -> String {
        format!("{}.{}.", self.major, self.minor)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    /// Snapshots sort after every release of their branch; a pre-release
    /// sorts before the release it precedes.
    fn cmp(&self, other: &Self) -> Ordering {
        let patch_rank = |v: &ReleaseVersion| v.patch.unwrap_or(u64::MAX);
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| patch_rank(self).cmp(&patch_rank(other)))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

/// One entry of the release feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub security: bool,
}

/// The release feed for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableReleases {
    /// Newest first.
    #[serde(default)]
    pub releases: Vec<ReleaseInfo>,
    /// Branch keys (`10.1.`) that still receive security coverage.
    #[serde(default)]
    pub supported_branches: Vec<String>,
}

impl AvailableReleases {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| StageError::io("Failed to read releases", e))?;
        serde_json::from_str(&content).map_err(|e| {
            StageError::json(format!("Malformed release feed {}", path.display()), e)
        })
    }

    pub fn get(&self, version: &ReleaseVersion) -> Option<&ReleaseInfo> {
        self.releases.iter().find(|release| {
            ReleaseVersion::parse(&release.version).is_some_and(|parsed| &parsed == version)
        })
    }

    pub fn is_supported_branch(&self, version: &ReleaseVersion) -> bool {
        let branch = version.branch();
        self.supported_branches.iter().any(|b| *b == branch)
    }

    /// Parsed releases newer than `installed`, newest first. Unparseable
    /// entries are skipped.
    pub fn installable_after(&self, installed: &ReleaseVersion) -> Vec<ReleaseVersion> {
        let mut newer = self
            .releases
            .iter()
            .filter_map(|release| ReleaseVersion::parse(&release.version))
            .filter(|version| !version.is_dev() && version > installed)
            .collect::<Vec<_>>();
        newer.sort_by(|a, b| b.cmp(a));
        newer
    }
}

/// The version an update should move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRelease {
    pub version: ReleaseVersion,
    pub security: bool,
    pub stability: Stability,
    pub branch: String,
}

impl TargetRelease {
    pub(crate) fn new(version: ReleaseVersion, releases: &AvailableReleases) -> Self {
        let security = releases.get(&version).is_some_and(|info| info.security);
        Self {
            security,
            stability: version.stability(),
            branch: version.branch(),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(version: &str) -> ReleaseVersion {
        ReleaseVersion::parse(version).unwrap()
    }

    #[test]
    fn parses_release_forms() {
        let stable = v("10.1.2");
        assert_eq!((stable.major, stable.minor, stable.patch), (10, 1, Some(2)));
        assert_eq!(stable.stability(), Stability::Stable);

        assert_eq!(v("10.2.0-rc1").stability(), Stability::PreRelease);
        assert_eq!(v("10.1.x-dev").stability(), Stability::Dev);
        assert_eq!(v("v10.1.2"), stable);
        assert!(ReleaseVersion::parse("8.x-1.2").is_none());
        assert!(ReleaseVersion::parse("latest").is_none());
    }

    #[test]
    fn ordering() {
        assert!(v("10.1.2") > v("10.1.1"));
        assert!(v("10.2.0") > v("10.1.9"));
        assert!(v("10.2.0") > v("10.2.0-rc1"));
        assert!(v("10.2.0-rc1") > v("10.2.0-beta2"));
        assert!(v("10.1.x-dev") > v("10.1.9"));
        assert!(v("11.0.0") > v("10.9.9"));
    }

    #[test]
    fn installable_after_is_newest_first() {
        let releases = AvailableReleases {
            releases: vec![
                ReleaseInfo { version: "10.1.1".into(), security: false },
                ReleaseInfo { version: "10.1.3".into(), security: true },
                ReleaseInfo { version: "10.1.x-dev".into(), security: false },
                ReleaseInfo { version: "10.1.0".into(), security: false },
            ],
            supported_branches: vec!["10.1.".into()],
        };
        let newer = releases.installable_after(&v("10.1.0"));
        let names = newer.iter().map(|r| r.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["10.1.3", "10.1.1"]);
        assert!(releases.is_supported_branch(&v("10.1.0")));
        assert!(!releases.is_supported_branch(&v("10.0.0")));
    }

    #[test]
    fn feed_deserializes_with_defaults() {
        let feed: AvailableReleases =
            serde_json::from_str(r#"{"releases":[{"version":"10.1.1"}]}"#).unwrap();
        assert!(!feed.releases[0].security);
        assert!(feed.supported_branches.is_empty());
    }

    #[test]
    fn unattended_mode_serde() {
        let mode: UnattendedMode = serde_json::from_str("\"patch\"").unwrap();
        assert_eq!(mode, UnattendedMode::Patch);
        assert_eq!(UnattendedMode::default(), UnattendedMode::Security);
    }
}
