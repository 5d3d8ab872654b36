//! Package model and manifest comparison.
//!
//! Two kinds of manifest are read here:
//!
//! - The installed-packages list written by the package manager
//!   (`<vendor>/composer/installed.json`), which gives name, version, type and
//!   install path of everything actually on disk.
//! - The project's `composer.json`, whose requirement sections are read and
//!   patched in place. Only `require` and `require-dev` are ever touched; key
//!   order and every other section survive a round trip untouched.
//!
//! Comparison is by package name with exact version strings (after trimming
//! and dropping a leading `v`). No version ranges are interpreted.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::{Result, StageError};
use crate::paths;

/// Name of the dependency manifest in a project root.
pub const COMPOSER_JSON: &str = "composer.json";
/// Name of the resolved lock file in a project root.
pub const COMPOSER_LOCK: &str = "composer.lock";

/// Normalizes a version string for comparison.
pub fn normalize_version(version: &str) -> String {
    let trimmed = version.trim();
    trimmed
        .strip_prefix(['v', 'V'])
        .unwrap_or(trimmed)
        .to_string()
}

/// One installed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
    /// Package type, e.g. `library`, `drupal-module`, `drupal-theme`.
    pub package_type: String,
    /// Install location relative to the project root, when known.
    pub install_path: Option<String>,
    /// True for packages only required by `require-dev`.
    pub dev: bool,
    #[serde(default)]
    pub extra: Value,
}

/// Raw package record as it appears in installed.json.
#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(rename = "type", default = "default_package_type")]
    package_type: String,
    #[serde(rename = "install-path", default)]
    install_path: Option<String>,
    #[serde(default)]
    extra: Value,
}

fn default_package_type() -> String {
    "library".to_string()
}

/// Composer 2 writes an object, Composer 1 a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InstalledFile {
    V2 {
        packages: Vec<RawPackage>,
        #[serde(rename = "dev-package-names", default)]
        dev_package_names: Vec<String>,
    },
    V1(Vec<RawPackage>),
}

/// Name-keyed set of installed packages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageList {
    packages: BTreeMap<String, PackageEntry>,
}

impl PackageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the installed-packages list under a codebase root.
    pub fn installed_file(root: &Path, vendor_dir: &str) -> PathBuf {
        root.join(vendor_dir).join("composer").join("installed.json")
    }

    /// Reads the installed packages of the codebase at `root`.
    ///
    /// A missing installed.json means nothing is installed yet and yields an
    /// empty list; an unreadable or malformed one is an error.
    pub fn load(root: &Path, vendor_dir: &str) -> Result<Self> {
        let path = Self::installed_file(root, vendor_dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(err) => return Err(StageError::io("Failed to read installed packages", err)),
        };

        let parsed: InstalledFile = serde_json::from_str(&content).map_err(|e| {
            StageError::json(format!("Malformed installed packages {}", path.display()), e)
        })?;

        let (raw, dev_names) = match parsed {
            InstalledFile::V2 {
                packages,
                dev_package_names,
            } => (packages, dev_package_names),
            InstalledFile::V1(packages) => (packages, Vec::new()),
        };

        // install-path is relative to <vendor>/composer
        let base = format!("{}/composer", vendor_dir.trim_end_matches('/'));
        let mut list = Self::new();
        for package in raw {
            let install_path = package
                .install_path
                .as_deref()
                .and_then(|p| paths::normalize_relative(&format!("{}/{}", base, p)));
            let dev = dev_names.contains(&package.name);
            list.insert(PackageEntry {
                name: package.name,
                version: package.version,
                package_type: package.package_type,
                install_path,
                dev,
                extra: package.extra,
            });
        }
        Ok(list)
    }

    pub fn insert(&mut self, entry: PackageEntry) {
        self.packages.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&PackageEntry> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageEntry> {
        self.packages.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Project-relative install paths of every package that has one.
    pub fn install_paths(&self) -> impl Iterator<Item = &str> {
        self.packages
            .values()
            .filter_map(|entry| entry.install_path.as_deref())
    }

    /// Entries present in `self` but absent by name from `other`.
    pub fn only_in(&self, other: &PackageList) -> BTreeMap<String, PackageEntry> {
        packages_only_in(self, other)
    }

    /// Entries of `self` that `other` has at a different version.
    pub fn with_different_versions(&self, other: &PackageList) -> BTreeMap<String, PackageEntry> {
        packages_with_different_versions(self, other)
    }

    /// Project-root scaffold files declared by the given core packages.
    ///
    /// Reads `extra.drupal-scaffold.file-mapping` and keeps the keys that
    /// start with `[project-root]/`.
    pub fn project_scaffold_files(&self, core_packages: &[String]) -> Vec<String> {
        let mut files = Vec::new();
        for name in core_packages {
            let Some(mapping) = self
                .get(name)
                .and_then(|entry| entry.extra.get("drupal-scaffold"))
                .and_then(|scaffold| scaffold.get("file-mapping"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            for key in mapping.keys() {
                if let Some(file) = key
                    .strip_prefix("[project-root]/")
                    .and_then(paths::normalize_relative)
                {
                    if !files.contains(&file) {
                        files.push(file);
                    }
                }
            }
        }
        files
    }
}

impl FromIterator<PackageEntry> for PackageList {
    fn from_iter<I: IntoIterator<Item = PackageEntry>>(iter: I) -> Self {
        let mut list = PackageList::new();
        for entry in iter {
            list.insert(entry);
        }
        list
    }
}

/// Entries present by name in `a` but absent from `b`.
///
/// Swapping the arguments yields the complementary set, so
/// `packages_only_in(staged, active)` is "added" and
/// `packages_only_in(active, staged)` is "removed".
pub fn packages_only_in(a: &PackageList, b: &PackageList) -> BTreeMap<String, PackageEntry> {
    a.packages
        .iter()
        .filter(|(name, _)| !b.packages.contains_key(*name))
        .map(|(name, entry)| (name.clone(), entry.clone()))
        .collect()
}

/// Entries of `a` whose version differs from the same-named entry of `b`.
pub fn packages_with_different_versions(
    a: &PackageList,
    b: &PackageList,
) -> BTreeMap<String, PackageEntry> {
    a.packages
        .iter()
        .filter(|(name, entry)| {
            b.packages.get(*name).is_some_and(|other| {
                normalize_version(&other.version) != normalize_version(&entry.version)
            })
        })
        .map(|(name, entry)| (name.clone(), entry.clone()))
        .collect()
}

/// A version change of one package between two manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub from: String,
    pub to: String,
}

/// Everything that differs between an active and a staged manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDiff {
    pub added: BTreeMap<String, PackageEntry>,
    pub removed: BTreeMap<String, PackageEntry>,
    pub changed: BTreeMap<String, VersionChange>,
}

impl ManifestDiff {
    pub fn between(active: &PackageList, staged: &PackageList) -> Self {
        let changed = packages_with_different_versions(active, staged)
            .into_iter()
            .filter_map(|(name, entry)| {
                let to = staged.get(&name)?.version.clone();
                Some((
                    name,
                    VersionChange {
                        from: entry.version,
                        to,
                    },
                ))
            })
            .collect();

        Self {
            added: packages_only_in(staged, active),
            removed: packages_only_in(active, staged),
            changed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Names touched in any way, sorted.
    pub fn touched_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .added
            .keys()
            .chain(self.removed.keys())
            .chain(self.changed.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// composer.json
// ═══════════════════════════════════════════════════════════════════════════════

/// A requirement section of composer.json.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementSection {
    Require,
    RequireDev,
}

impl RequirementSection {
    pub fn key(self) -> &'static str {
        match self {
            RequirementSection::Require => "require",
            RequirementSection::RequireDev => "require-dev",
        }
    }
}

/// composer.json held as an order-preserving JSON document.
///
/// The lifecycle only reads it; with Composer the requirement edits happen
/// through `require --no-update`. `set_requirement` and `save` are for
/// [`Stager`](crate::tool::Stager) implementations that do not shell out
/// and must patch the staged file themselves.
#[derive(Debug, Clone)]
pub struct ComposerJson {
    path: PathBuf,
    document: Value,
}

impl ComposerJson {
    /// Loads `<root>/composer.json`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(COMPOSER_JSON);
        let content = fs::read_to_string(&path)
            .map_err(|e| StageError::io("Failed to read composer.json", e))?;
        let document: Value = serde_json::from_str(&content)
            .map_err(|e| StageError::json(format!("Malformed {}", path.display()), e))?;
        if !document.is_object() {
            return Err(StageError::InvalidArgument(format!(
                "{} does not contain a JSON object",
                path.display()
            )));
        }
        Ok(Self { path, document })
    }

    /// Constraint for `name` in `section`, if present.
    pub fn requirement(&self, section: RequirementSection, name: &str) -> Option<&str> {
        self.document
            .get(section.key())
            .and_then(|requirements| requirements.get(name))
            .and_then(Value::as_str)
    }

    /// All requirements of a section.
    pub fn requirements(&self, section: RequirementSection) -> BTreeMap<String, String> {
        self.document
            .get(section.key())
            .and_then(Value::as_object)
            .map(|requirements| {
                requirements
                    .iter()
                    .filter_map(|(name, constraint)| {
                        constraint.as_str().map(|c| (name.clone(), c.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sets one requirement, creating the section if needed.
    pub fn set_requirement(&mut self, section: RequirementSection, name: &str, constraint: &str) {
        let Some(document) = self.document.as_object_mut() else {
            return;
        };
        let requirements = document
            .entry(section.key())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(requirements) = requirements.as_object_mut() {
            requirements.insert(name.to_string(), Value::String(constraint.to_string()));
        }
    }

    /// Writes the document back atomically with four-space indentation.
    pub fn save(&self) -> Result<()> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.document
            .serialize(&mut serializer)
            .map_err(|e| StageError::json("Failed to serialize composer.json", e))?;
        buffer.push(b'\n');

        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| StageError::InvalidArgument("composer.json has no parent".into()))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| StageError::io("Failed to create temp composer.json", e))?;
        temp_file
            .write_all(&buffer)
            .map_err(|e| StageError::io("Failed to write temp composer.json", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| StageError::io("Failed to replace composer.json", e.error))?;
        Ok(())
    }
}

/// MD5 digest of `<root>/composer.lock`, or `None` when there is no lock file.
pub fn lock_file_hash(root: &Path) -> Result<Option<String>> {
    match fs::read(root.join(COMPOSER_LOCK)) {
        Ok(bytes) => Ok(Some(format!("{:x}", md5::compute(bytes)))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StageError::io("Failed to read composer.lock", err)),
    }
}
