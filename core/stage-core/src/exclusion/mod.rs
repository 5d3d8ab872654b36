//! Paths that must never be copied between the live codebase and a stage.
//!
//! Independent providers each contribute project-root-relative paths; the
//! registry unions them into an [`ExclusionSet`] before every copy. Providers
//! only inspect: they never create, move or delete anything, so collecting
//! twice with unchanged inputs yields the same set.
//!
//! # Direction
//!
//! A copy either populates a stage from the live directory
//! ([`CopyDirection::IntoStage`]) or syncs a stage back over it
//! ([`CopyDirection::BackToActive`]). Built-in rules apply to both; configured
//! rules may be limited to one via [`RuleScope`].
//!
//! # Matching
//!
//! A rule covers itself and everything below it, on whole path components.
//! An excluded path is neither copied into the destination nor deleted from
//! it.

mod providers;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SiteConfig;
use crate::error::Result;
use crate::manifest::PackageList;
use crate::paths;

pub use providers::{
    ConfiguredExclusions, DatabaseFileExclusions, NodeModulesExclusions,
    SiteConfigurationExclusions, SiteFilesExclusions, TestSiteExclusions, UnknownPathExclusions,
    VcsMetadataExclusions, VendorHardeningExclusions,
};

/// Which way a bulk copy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Live directory → stage (begin).
    IntoStage,
    /// Stage → live directory (apply).
    BackToActive,
}

/// Copies a configured rule takes part in.
///
/// A path kept out of the stage is also left alone on copy-back, otherwise
/// the delete pass would remove it from the live codebase. So `Stage` only
/// differs from `Both` in intent; `Apply` is the one narrower scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Not copied into the stage, and never touched on copy-back.
    Stage,
    /// Copied into the stage but not applied back.
    Apply,
    #[default]
    Both,
}

impl RuleScope {
    pub fn applies_to(self, direction: CopyDirection) -> bool {
        match self {
            RuleScope::Both | RuleScope::Stage => true,
            RuleScope::Apply => direction == CopyDirection::BackToActive,
        }
    }
}

/// Root a configured rule path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleBase {
    #[default]
    Project,
    Web,
}

/// A path excluded from bulk copies, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub path: String,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub relative_to: RuleBase,
}

/// Everything a provider may inspect.
#[derive(Debug, Clone, Copy)]
pub struct ExclusionContext<'a> {
    pub direction: CopyDirection,
    pub project_root: &'a Path,
    /// Present when a stage exists; scanned as well when applying.
    pub stage_dir: Option<&'a Path>,
    /// Project-relative web root; `None` when it is the project root.
    pub web_prefix: Option<&'a str>,
    pub vendor_dir: &'a str,
    pub site: &'a SiteConfig,
    pub core_packages: &'a [String],
    pub active_packages: &'a PackageList,
    pub staged_packages: Option<&'a PackageList>,
}

impl<'a> ExclusionContext<'a> {
    /// Directories whose contents decide path-dependent rules.
    pub fn scan_roots(&self) -> Vec<&'a Path> {
        let mut roots = vec![self.project_root];
        if self.direction == CopyDirection::BackToActive {
            if let Some(stage) = self.stage_dir {
                roots.push(stage);
            }
        }
        roots
    }

    /// Package lists whose install paths are "known".
    pub fn known_packages(&self) -> Vec<&'a PackageList> {
        let mut lists = vec![self.active_packages];
        if let Some(staged) = self.staged_packages {
            lists.push(staged);
        }
        lists
    }
}

/// Normalized, de-duplicated set of project-relative excluded paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    paths: BTreeSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a project-root-relative path. Paths that normalize to the root
    /// or escape it are ignored.
    pub fn add_project_path(&mut self, path: &str) {
        if let Some(normalized) = paths::normalize_relative(path) {
            self.paths.insert(normalized);
        }
    }

    /// Adds a web-root-relative path.
    pub fn add_web_path(&mut self, web_prefix: Option<&str>, path: &str) {
        if let Some(normalized) = paths::web_to_project(web_prefix, path) {
            self.paths.insert(normalized);
        }
    }

    /// Adds an absolute path if it lies inside `project_root`.
    pub fn add_absolute_path(&mut self, project_root: &Path, path: &Path) {
        if let Some(relative) = paths::relative_to(project_root, path) {
            self.paths.insert(relative);
        }
    }

    pub fn extend(&mut self, other: ExclusionSet) {
        self.paths.extend(other.paths);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// True if some rule covers `candidate` (itself or an ancestor).
    pub fn covers(&self, candidate: &str) -> bool {
        self.paths
            .iter()
            .any(|rule| paths::is_covered_by(rule, candidate))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A source of excluded paths.
///
/// Providers must be side-effect free. A provider whose feature is not
/// configured contributes nothing; only unexpected I/O failures are errors.
pub trait ExclusionProvider {
    fn name(&self) -> &'static str;

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()>;
}

/// Ordered list of providers consulted before each copy.
pub struct ExclusionRegistry {
    providers: Vec<Box<dyn ExclusionProvider>>,
}

impl ExclusionRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// The built-in providers plus any configured rules.
    pub fn with_defaults(extra_rules: Vec<ExclusionRule>) -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(VcsMetadataExclusions));
        registry.register(Box::new(NodeModulesExclusions));
        registry.register(Box::new(SiteConfigurationExclusions));
        registry.register(Box::new(SiteFilesExclusions));
        registry.register(Box::new(DatabaseFileExclusions));
        registry.register(Box::new(TestSiteExclusions));
        registry.register(Box::new(UnknownPathExclusions));
        registry.register(Box::new(VendorHardeningExclusions));
        if !extra_rules.is_empty() {
            registry.register(Box::new(ConfiguredExclusions::new(extra_rules)));
        }
        registry
    }

    pub fn register(&mut self, provider: Box<dyn ExclusionProvider>) {
        self.providers.push(provider);
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Unions every provider's contribution.
    pub fn collect(&self, ctx: &ExclusionContext<'_>) -> Result<ExclusionSet> {
        let mut set = ExclusionSet::new();
        for provider in &self.providers {
            let mut contribution = ExclusionSet::new();
            provider.contribute(ctx, &mut contribution)?;
            debug!(
                provider = provider.name(),
                count = contribution.len(),
                direction = ?ctx.direction,
                "Collected exclusions"
            );
            set.extend(contribution);
        }
        Ok(set)
    }
}

impl std::fmt::Debug for ExclusionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusionRegistry")
            .field("providers", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_normalizes_and_dedups() {
        let mut set = ExclusionSet::new();
        set.add_project_path("./sites/default/files/");
        set.add_project_path("sites/default/files");
        set.add_web_path(Some("web"), "sites/simpletest");
        set.add_project_path("../escape");
        set.add_project_path("");

        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["sites/default/files", "web/sites/simpletest"]
        );
    }

    #[test]
    fn absolute_paths_outside_root_are_ignored() {
        let mut set = ExclusionSet::new();
        set.add_absolute_path(Path::new("/srv/site"), Path::new("/srv/site/private"));
        set.add_absolute_path(Path::new("/srv/site"), Path::new("/var/private"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["private"]);
    }

    #[test]
    fn covers_descendants_only() {
        let mut set = ExclusionSet::new();
        set.add_project_path("web/sites/default/files");
        assert!(set.covers("web/sites/default/files"));
        assert!(set.covers("web/sites/default/files/img.png"));
        assert!(!set.covers("web/sites/default"));
        assert!(!set.covers("web/sites/default/files2"));
    }

    #[test]
    fn scope_filters_direction() {
        assert!(RuleScope::Both.applies_to(CopyDirection::IntoStage));
        assert!(RuleScope::Stage.applies_to(CopyDirection::IntoStage));
        assert!(RuleScope::Stage.applies_to(CopyDirection::BackToActive));
        assert!(RuleScope::Apply.applies_to(CopyDirection::BackToActive));
        assert!(!RuleScope::Apply.applies_to(CopyDirection::IntoStage));
    }
}
