//! Configuration loading for the stage engine.
//!
//! A project is described by a TOML file:
//!
//! ```toml
//! project_root = "/srv/site"
//! web_root = "web"
//! staging_root = "/var/tmp/site-stages"
//! unattended_mode = "security"
//!
//! [site]
//! site_path = "sites/default"
//! public_files = "sites/default/files"
//! private_files = "/srv/private"
//!
//! [site.database]
//! driver = "sqlite"
//! path = "sites/default/files/.ht.sqlite"
//! ```
//!
//! Every field except `project_root` has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::exclusion::ExclusionRule;
use crate::paths;
use crate::release::UnattendedMode;
use crate::storage::StoragePaths;

fn default_vendor_dir() -> String {
    "vendor".to_string()
}

fn default_composer() -> PathBuf {
    PathBuf::from("composer")
}

fn default_site_path() -> String {
    "sites/default".to_string()
}

fn default_core_packages() -> Vec<String> {
    vec![
        "drupal/core".to_string(),
        "drupal/core-recommended".to_string(),
        "drupal/core-composer-scaffold".to_string(),
    ]
}

fn default_watched_types() -> Vec<String> {
    vec![
        "drupal-module".to_string(),
        "drupal-theme".to_string(),
        "drupal-profile".to_string(),
        "drupal-custom-module".to_string(),
        "drupal-custom-theme".to_string(),
    ]
}

/// Settings of the site served from the web root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site-specific directory, relative to the web root.
    #[serde(default = "default_site_path")]
    pub site_path: String,
    /// Public files directory. Relative values are web-root-relative.
    #[serde(default)]
    pub public_files: Option<String>,
    /// Private files directory. Relative values are web-root-relative.
    #[serde(default)]
    pub private_files: Option<String>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_path: default_site_path(),
            public_files: None,
            private_files: None,
            database: None,
        }
    }
}

/// Active database connection, as far as exclusions care.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub driver: String,
    /// Data file for file-based drivers. Relative values are web-root-relative.
    #[serde(default)]
    pub path: Option<String>,
}

impl DatabaseConfig {
    /// Drivers whose data lives in a single file next to the code.
    pub fn is_file_based(&self) -> bool {
        matches!(self.driver.as_str(), "sqlite" | "sqlite3")
    }
}

/// Full engine configuration for one project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Absolute path of the live codebase.
    pub project_root: PathBuf,
    /// Web root relative to the project root; `None` when they are the same.
    #[serde(default)]
    pub web_root: Option<PathBuf>,
    #[serde(default = "default_vendor_dir")]
    pub vendor_dir: String,
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_composer")]
    pub composer_executable: PathBuf,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default = "default_core_packages")]
    pub core_packages: Vec<String>,
    #[serde(default = "default_watched_types")]
    pub watched_package_types: Vec<String>,
    #[serde(default)]
    pub unattended_mode: UnattendedMode,
    #[serde(default)]
    pub lock_ttl_secs: Option<u64>,
    /// Commands run in the project root after a successful apply.
    #[serde(default)]
    pub post_apply_commands: Vec<Vec<String>>,
    #[serde(default)]
    pub extra_exclusions: Vec<ExclusionRule>,
    /// Seconds allowed for each package-manager invocation.
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
}

impl StageConfig {
    /// Default configuration for a project root.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            web_root: None,
            vendor_dir: default_vendor_dir(),
            staging_root: None,
            state_dir: None,
            composer_executable: default_composer(),
            site: SiteConfig::default(),
            core_packages: default_core_packages(),
            watched_package_types: default_watched_types(),
            unattended_mode: UnattendedMode::default(),
            lock_ttl_secs: None,
            post_apply_commands: Vec::new(),
            extra_exclusions: Vec::new(),
            tool_timeout_secs: None,
        }
    }

    /// Loads configuration from a TOML file.
    ///
    /// A relative `project_root` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| StageError::io("Failed to read config", e))?;
        let mut config: StageConfig =
            toml::from_str(&content).map_err(|e| StageError::ConfigMalformed {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;

        if config.project_root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.project_root = base.join(&config.project_root);
        }

        if let Some(web_root) = &config.web_root {
            if web_root.is_absolute() {
                let relative = paths::relative_to(&config.project_root, web_root).ok_or_else(
                    || StageError::ConfigMalformed {
                        path: path.to_path_buf(),
                        details: format!(
                            "web_root {} is not inside project_root {}",
                            web_root.display(),
                            config.project_root.display()
                        ),
                    },
                )?;
                config.web_root = Some(PathBuf::from(relative));
            }
        }

        Ok(config)
    }

    /// Bookkeeping paths for this configuration.
    pub fn storage(&self) -> StoragePaths {
        match &self.state_dir {
            Some(dir) => StoragePaths::with_root(dir.clone()),
            None => StoragePaths::default(),
        }
    }

    /// Project-relative web root, or `None` when web root == project root.
    pub fn web_prefix(&self) -> Option<String> {
        self.web_root
            .as_deref()
            .and_then(|web| paths::normalize_relative(&paths::to_slash(web)))
    }

    /// Absolute web root.
    pub fn web_root_path(&self) -> PathBuf {
        match self.web_prefix() {
            Some(prefix) => self.project_root.join(prefix),
            None => self.project_root.clone(),
        }
    }

    /// Absolute vendor directory.
    pub fn vendor_path(&self) -> PathBuf {
        self.project_root.join(&self.vendor_dir)
    }

    /// Directory under which stage directories are created.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| StoragePaths::default_staging_root(&self.project_root))
    }

    pub fn failure_marker_path(&self) -> PathBuf {
        StoragePaths::failure_marker_file(&self.project_root)
    }

    pub fn lock_ttl(&self) -> Option<chrono::Duration> {
        self.lock_ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage.toml");
        fs::write(&path, "project_root = \"/srv/site\"\n").unwrap();

        let config = StageConfig::load(&path).unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/site"));
        assert_eq!(config.vendor_dir, "vendor");
        assert_eq!(config.site.site_path, "sites/default");
        assert_eq!(config.unattended_mode, UnattendedMode::Security);
        assert_eq!(config.web_prefix(), None);
    }

    #[test]
    fn relative_project_root_resolves_against_config_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage.toml");
        fs::write(&path, "project_root = \"site\"\nweb_root = \"web\"\n").unwrap();

        let config = StageConfig::load(&path).unwrap();
        assert_eq!(config.project_root, tmp.path().join("site"));
        assert_eq!(config.web_prefix().as_deref(), Some("web"));
        assert_eq!(config.web_root_path(), tmp.path().join("site").join("web"));
    }

    #[test]
    fn absolute_web_root_becomes_relative() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage.toml");
        fs::write(
            &path,
            "project_root = \"/srv/site\"\nweb_root = \"/srv/site/docroot\"\n",
        )
        .unwrap();

        let config = StageConfig::load(&path).unwrap();
        assert_eq!(config.web_prefix().as_deref(), Some("docroot"));
    }

    #[test]
    fn malformed_toml_is_reported_with_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stage.toml");
        fs::write(&path, "project_root = [").unwrap();

        let err = StageConfig::load(&path).unwrap_err();
        assert!(matches!(err, StageError::ConfigMalformed { .. }));
    }

    #[test]
    fn sqlite_is_file_based() {
        let db = DatabaseConfig {
            driver: "sqlite".to_string(),
            path: Some("db.sqlite".to_string()),
        };
        assert!(db.is_file_based());
        let db = DatabaseConfig {
            driver: "mysql".to_string(),
            path: None,
        };
        assert!(!db.is_file_based());
    }
}
