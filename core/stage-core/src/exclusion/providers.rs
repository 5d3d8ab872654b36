//! Built-in exclusion providers.
//!
//! | Provider                      | Excludes                                            |
//! |-------------------------------|-----------------------------------------------------|
//! | `VcsMetadataExclusions`       | `.git` dirs, except directly under a package        |
//! | `NodeModulesExclusions`       | `node_modules` dirs                                 |
//! | `SiteConfigurationExclusions` | settings files of the site and default site         |
//! | `SiteFilesExclusions`         | public and private files directories                |
//! | `DatabaseFileExclusions`      | file-based database plus `-shm`/`-wal`              |
//! | `TestSiteExclusions`          | `sites/simpletest`                                  |
//! | `UnknownPathExclusions`       | unrecognised top-level entries (split web root)     |
//! | `VendorHardeningExclusions`   | `web.config`, `.htaccess` in vendor                 |

use std::path::Path;

use fs_err as fs;
use walkdir::WalkDir;

use super::{ExclusionContext, ExclusionProvider, ExclusionRule, ExclusionSet, RuleBase};
use crate::error::{Result, StageError};
use crate::manifest::{COMPOSER_JSON, COMPOSER_LOCK};
use crate::paths;

/// Settings files excluded under the site directories.
pub const SITE_SETTINGS_FILES: &[&str] = &["settings.php", "settings.local.php", "services.yml"];

/// Default site directory, relative to the web root.
pub const DEFAULT_SITE_PATH: &str = "sites/default";

/// Ephemeral test site artifacts, relative to the web root.
pub const TEST_SITE_PATH: &str = "sites/simpletest";

/// Hardening files dropped into the vendor directory.
pub const VENDOR_HARDENING_FILES: &[&str] = &["web.config", ".htaccess"];

/// Companion files of an embedded database.
const DATABASE_COMPANION_SUFFIXES: &[&str] = &["-shm", "-wal"];

/// Finds every directory literally named `name` under `root`.
///
/// Returns project-relative paths. Matching directories are not descended
/// into.
fn find_directories_named(root: &Path, name: &str) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let context = format!("Failed to scan {}", root.display());
            match e.into_io_error() {
                Some(io) => StageError::io(context, io),
                None => StageError::io(
                    context,
                    std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"),
                ),
            }
        })?;

        if !entry.file_type().is_dir() || entry.file_name() != name {
            continue;
        }
        walker.skip_current_dir();

        if let Ok(relative) = entry.path().strip_prefix(root) {
            if let Some(normalized) = paths::normalize_relative(&paths::to_slash(relative)) {
                found.push(normalized);
            }
        }
    }
    Ok(found)
}

/// `.git` directories, except those sitting directly beneath the install path
/// of a known package (installed from source control, needed for future
/// operations on it).
#[derive(Debug, Default)]
pub struct VcsMetadataExclusions;

impl ExclusionProvider for VcsMetadataExclusions {
    fn name(&self) -> &'static str {
        "vcs_metadata"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        let install_paths: Vec<&str> = ctx
            .known_packages()
            .into_iter()
            .flat_map(|list| list.install_paths())
            .collect();

        for root in ctx.scan_roots() {
            for git_dir in find_directories_named(root, ".git")? {
                let parent = git_dir
                    .rsplit_once('/')
                    .map(|(parent, _)| parent)
                    .unwrap_or("");
                if install_paths.contains(&parent) {
                    continue;
                }
                set.add_project_path(&git_dir);
            }
        }
        Ok(())
    }
}

/// `node_modules` directories anywhere in the tree.
#[derive(Debug, Default)]
pub struct NodeModulesExclusions;

impl ExclusionProvider for NodeModulesExclusions {
    fn name(&self) -> &'static str {
        "node_modules"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        for root in ctx.scan_roots() {
            for dir in find_directories_named(root, "node_modules")? {
                set.add_project_path(&dir);
            }
        }
        Ok(())
    }
}

/// Settings files of the configured site and of the default site.
#[derive(Debug, Default)]
pub struct SiteConfigurationExclusions;

impl ExclusionProvider for SiteConfigurationExclusions {
    fn name(&self) -> &'static str {
        "site_configuration"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        for site_dir in [ctx.site.site_path.as_str(), DEFAULT_SITE_PATH] {
            for file in SITE_SETTINGS_FILES {
                set.add_web_path(ctx.web_prefix, &format!("{}/{}", site_dir, file));
            }
        }
        Ok(())
    }
}

/// Public and private files directories.
///
/// Absolute paths are kept when inside the project root; relative paths are
/// web-root-relative.
#[derive(Debug, Default)]
pub struct SiteFilesExclusions;

impl SiteFilesExclusions {
    fn add(ctx: &ExclusionContext<'_>, set: &mut ExclusionSet, configured: &str) {
        let path = Path::new(configured);
        if path.is_absolute() {
            set.add_absolute_path(ctx.project_root, path);
        } else {
            set.add_web_path(ctx.web_prefix, configured);
        }
    }
}

impl ExclusionProvider for SiteFilesExclusions {
    fn name(&self) -> &'static str {
        "site_files"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        for configured in [&ctx.site.public_files, &ctx.site.private_files]
            .into_iter()
            .flatten()
        {
            Self::add(ctx, set, configured);
        }
        Ok(())
    }
}

/// Data file of a file-based database and its companions, when inside the
/// project root.
#[derive(Debug, Default)]
pub struct DatabaseFileExclusions;

impl ExclusionProvider for DatabaseFileExclusions {
    fn name(&self) -> &'static str {
        "database_files"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        let Some(database) = ctx.site.database.as_ref().filter(|db| db.is_file_based()) else {
            return Ok(());
        };
        let Some(configured) = database.path.as_deref() else {
            return Ok(());
        };

        let relative = if Path::new(configured).is_absolute() {
            paths::relative_to(ctx.project_root, Path::new(configured))
        } else {
            paths::web_to_project(ctx.web_prefix, configured)
        };
        let Some(relative) = relative else {
            return Ok(());
        };

        set.add_project_path(&relative);
        for suffix in DATABASE_COMPANION_SUFFIXES {
            set.add_project_path(&format!("{}{}", relative, suffix));
        }
        Ok(())
    }
}

/// Test-site artifacts.
#[derive(Debug, Default)]
pub struct TestSiteExclusions;

impl ExclusionProvider for TestSiteExclusions {
    fn name(&self) -> &'static str {
        "test_site"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        set.add_web_path(ctx.web_prefix, TEST_SITE_PATH);
        Ok(())
    }
}

/// Top-level entries the engine does not recognise.
///
/// Only active when the web root is a subdirectory of the project root. Known
/// entries are the vendor directory, the web root, the two manifest files and
/// project-root scaffold files declared by core packages.
#[derive(Debug, Default)]
pub struct UnknownPathExclusions;

impl ExclusionProvider for UnknownPathExclusions {
    fn name(&self) -> &'static str {
        "unknown_paths"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        let Some(web_prefix) = ctx.web_prefix else {
            return Ok(());
        };

        let top_level = |path: &str| -> String {
            path.split('/').next().unwrap_or(path).to_string()
        };
        let mut known: Vec<String> = vec![
            top_level(ctx.vendor_dir.trim_matches('/')),
            top_level(web_prefix),
            COMPOSER_JSON.to_string(),
            COMPOSER_LOCK.to_string(),
        ];
        for list in ctx.known_packages() {
            known.extend(list.project_scaffold_files(ctx.core_packages));
        }

        for root in ctx.scan_roots() {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StageError::io("Failed to list project root", err)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| StageError::io("Failed to list project root", e))?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !known.contains(&name) {
                    set.add_project_path(&name);
                }
            }
        }
        Ok(())
    }
}

/// Hardening files written into the vendor directory.
#[derive(Debug, Default)]
pub struct VendorHardeningExclusions;

impl ExclusionProvider for VendorHardeningExclusions {
    fn name(&self) -> &'static str {
        "vendor_hardening"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        for file in VENDOR_HARDENING_FILES {
            set.add_project_path(&format!("{}/{}", ctx.vendor_dir, file));
        }
        Ok(())
    }
}

/// Rules from configuration.
#[derive(Debug, Default)]
pub struct ConfiguredExclusions {
    rules: Vec<ExclusionRule>,
}

impl ConfiguredExclusions {
    pub fn new(rules: Vec<ExclusionRule>) -> Self {
        Self { rules }
    }
}

impl ExclusionProvider for ConfiguredExclusions {
    fn name(&self) -> &'static str {
        "configured"
    }

    fn contribute(&self, ctx: &ExclusionContext<'_>, set: &mut ExclusionSet) -> Result<()> {
        for rule in self.rules.iter().filter(|r| r.scope.applies_to(ctx.direction)) {
            match rule.relative_to {
                RuleBase::Project => set.add_project_path(&rule.path),
                RuleBase::Web => set.add_web_path(ctx.web_prefix, &rule.path),
            }
        }
        Ok(())
    }
}
