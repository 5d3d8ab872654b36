//! Shared fixtures: a throwaway project and a fake package manager.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use fs_err as fs;
use serde_json::{json, Value};
use stage_core::{
    Committer, ComposerJson, ExclusionSet, RequirementSection, Result, StageConfig, StageError,
    Stager, ToolOutput,
};
use tempfile::TempDir;

pub struct Project {
    pub tmp: TempDir,
    pub config: StageConfig,
}

impl Project {
    pub fn root(&self) -> &Path {
        &self.config.project_root
    }
}

pub fn create_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn read(root: &Path, relative: &str) -> String {
    fs::read_to_string(root.join(relative)).unwrap()
}

/// A project with the given installed packages `(name, version, type)`,
/// each required at its installed version.
pub fn project_with(packages: &[(&str, &str, &str)]) -> Project {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("project");
    fs::create_dir_all(&root).unwrap();

    let require: serde_json::Map<String, Value> = packages
        .iter()
        .map(|(name, version, _)| (name.to_string(), json!(version)))
        .collect();
    create_file(
        &root,
        "composer.json",
        &serde_json::to_string_pretty(&json!({
            "name": "acme/site",
            "require": require,
            "config": { "sort-packages": true }
        }))
        .unwrap(),
    );

    let installed = packages
        .iter()
        .map(|(name, version, package_type)| {
            create_file(&root, &format!("vendor/{name}/VERSION"), version);
            installed_entry(name, version, package_type)
        })
        .collect::<Vec<_>>();
    write_installed(&root, installed);

    create_file(&root, "sites/default/settings.php", "<?php $db = 'live';");
    create_file(&root, "index.php", "<?php // front controller");

    let mut config = StageConfig::for_project(&root);
    config.staging_root = Some(tmp.path().join("stages"));
    config.state_dir = Some(tmp.path().join("state"));
    Project { tmp, config }
}

fn installed_entry(name: &str, version: &str, package_type: &str) -> Value {
    json!({
        "name": name,
        "version": version,
        "type": package_type,
        "install-path": format!("../{name}"),
    })
}

fn write_installed(root: &Path, packages: Vec<Value>) {
    create_file(
        root,
        "vendor/composer/installed.json",
        &serde_json::to_string_pretty(&json!({
            "packages": packages,
            "dev": true,
            "dev-package-names": []
        }))
        .unwrap(),
    );
}

/// Stands in for Composer. `require --no-update` patches composer.json,
/// `update` rewrites installed.json from the requirements, honouring
/// per-package overrides of the version that gets "resolved".
#[derive(Clone, Default)]
pub struct FakeComposer {
    pub calls: Rc<RefCell<Vec<Vec<String>>>>,
    pub resolve_overrides: BTreeMap<String, String>,
    pub package_types: BTreeMap<String, String>,
    pub fail_on: Option<String>,
}

impl FakeComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolving(mut self, name: &str, version: &str) -> Self {
        self.resolve_overrides
            .insert(name.to_string(), version.to_string());
        self
    }

    pub fn with_type(mut self, name: &str, package_type: &str) -> Self {
        self.package_types
            .insert(name.to_string(), package_type.to_string());
        self
    }

    pub fn failing_on(mut self, subcommand: &str) -> Self {
        self.fail_on = Some(subcommand.to_string());
        self
    }

    pub fn recorded_calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    fn update(&self, dir: &Path) -> Result<()> {
        let composer_json = ComposerJson::load(dir)?;
        let path = dir.join("vendor/composer/installed.json");
        let existing: Value = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| json!({ "packages": [] }));
        let mut packages = existing["packages"].as_array().cloned().unwrap_or_default();

        for section in [RequirementSection::Require, RequirementSection::RequireDev] {
            for (name, constraint) in composer_json.requirements(section) {
                let version = self
                    .resolve_overrides
                    .get(&name)
                    .cloned()
                    .unwrap_or(constraint);
                create_file(dir, &format!("vendor/{name}/VERSION"), &version);

                match packages.iter_mut().find(|p| p["name"] == json!(name)) {
                    Some(package) => package["version"] = json!(version),
                    None => {
                        let package_type = self
                            .package_types
                            .get(&name)
                            .map(String::as_str)
                            .unwrap_or("library");
                        packages.push(installed_entry(&name, &version, package_type));
                    }
                }
            }
        }
        write_installed(dir, packages);
        let resolved = json!(composer_json.requirements(RequirementSection::Require));
        create_file(dir, "composer.lock", &format!("{{\"resolved\": {resolved}}}"));
        Ok(())
    }
}

impl Stager for FakeComposer {
    fn stage(
        &self,
        working_dir: &Path,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        self.calls.borrow_mut().push(args.to_vec());
        let subcommand = args.first().cloned().unwrap_or_default();
        if self.fail_on.as_deref() == Some(subcommand.as_str()) {
            return Err(StageError::ToolInvocation {
                command: format!("composer {}", args.join(" ")),
                details: "Your requirements could not be resolved".to_string(),
            });
        }

        match subcommand.as_str() {
            "require" => {
                let section = if args.iter().any(|a| a == "--dev") {
                    RequirementSection::RequireDev
                } else {
                    RequirementSection::Require
                };
                let mut composer_json = ComposerJson::load(working_dir)?;
                for pair in args.iter().filter(|a| !a.starts_with("--") && *a != "require") {
                    if let Some((name, version)) = pair.split_once(':') {
                        composer_json.set_requirement(section, name, version);
                    }
                }
                composer_json.save()?;
            }
            "update" => self.update(working_dir)?,
            other => panic!("unexpected composer subcommand {other}"),
        }
        Ok(ToolOutput::default())
    }
}

/// Copies a single file and then fails, leaving the live codebase half
/// updated.
pub struct FailingCommitter;

impl Committer for FailingCommitter {
    fn commit(
        &self,
        stage: &Path,
        active: &Path,
        _exclusions: &ExclusionSet,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        let _ = fs::copy(stage.join("composer.json"), active.join("composer.json"));
        Err(StageError::Io {
            context: "Failed to copy vendor".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
        })
    }
}

pub fn stage_files(stage_dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(stage_dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(stage_dir).unwrap().to_path_buf())
        .collect()
}
