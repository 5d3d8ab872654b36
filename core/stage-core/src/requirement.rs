//! Desired package versions and the rules for what an update may request.
//!
//! Which packages an update may touch depends on who is updating:
//!
//! | Policy             | Packages                                   |
//! |--------------------|--------------------------------------------|
//! | `Extensions`       | at least one, any non-core package         |
//! | `CoreInteractive`  | exactly one, a core package                |
//! | `CoreUnattended`   | exactly one, a core package, cron rules    |
//!
//! The policy is chosen when a lifecycle is constructed; nothing subclasses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::release::SelectionMode;
use crate::release::UnattendedMode;

/// Package name → version constraint, split by requirement section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersions {
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,
    #[serde(default)]
    pub dev: BTreeMap<String, String>,
}

impl PackageVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.runtime.insert(name.into(), version.into());
        self
    }

    pub fn with_dev(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dev.insert(name.into(), version.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty() && self.dev.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runtime.len() + self.dev.len()
    }

    /// Every requested package, runtime first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.runtime
            .iter()
            .chain(self.dev.iter())
            .map(|(name, version)| (name.as_str(), version.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.runtime
            .get(name)
            .or_else(|| self.dev.get(name))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Parses `vendor/name:version` arguments.
    pub fn parse_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<BTreeMap<String, String>> {
        let mut parsed = BTreeMap::new();
        for pair in pairs {
            let (name, version) = pair.split_once(':').ok_or_else(|| {
                StageError::InvalidArgument(format!(
                    "'{pair}' is not in the form vendor/package:version"
                ))
            })?;
            parsed.insert(name.trim().to_string(), version.trim().to_string());
        }
        Ok(parsed)
    }

    /// Shape checks shared by every policy.
    fn check_well_formed(&self) -> Result<()> {
        for (name, version) in self.iter() {
            let valid_name = name
                .split_once('/')
                .is_some_and(|(vendor, package)| !vendor.is_empty() && !package.is_empty());
            if !valid_name {
                return Err(StageError::InvalidArgument(format!(
                    "'{name}' is not a valid package name"
                )));
            }
            if version.trim().is_empty() {
                return Err(StageError::InvalidArgument(format!(
                    "No version given for {name}"
                )));
            }
        }
        Ok(())
    }
}

/// What a lifecycle is allowed to update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Contributed projects; one or more packages.
    Extensions,
    /// Core, started by a person.
    CoreInteractive,
    /// Core, started by cron under the given mode.
    CoreUnattended(UnattendedMode),
}

impl UpdatePolicy {
    /// Rejects requests the policy does not allow.
    pub fn validate(&self, desired: &PackageVersions, core_packages: &[String]) -> Result<()> {
        desired.check_well_formed()?;

        match self {
            UpdatePolicy::Extensions => {
                if desired.is_empty() {
                    return Err(StageError::InvalidArgument(
                        "At least one project must be updated".to_string(),
                    ));
                }
                if let Some((name, _)) = desired
                    .iter()
                    .find(|(name, _)| core_packages.iter().any(|core| core == name))
                {
                    return Err(StageError::InvalidArgument(format!(
                        "{name} is a core package and cannot be updated as a project"
                    )));
                }
            }
            UpdatePolicy::CoreInteractive | UpdatePolicy::CoreUnattended(_) => {
                if desired.len() != 1 {
                    return Err(StageError::InvalidArgument(format!(
                        "Exactly one core package must be updated, {} given",
                        desired.len()
                    )));
                }
                let is_core = desired
                    .iter()
                    .all(|(name, _)| core_packages.iter().any(|core| core == name));
                if !is_core {
                    return Err(StageError::InvalidArgument(
                        "Only a core package can be updated by the core updater".to_string(),
                    ));
                }
                if matches!(self, UpdatePolicy::CoreUnattended(UnattendedMode::Disabled)) {
                    return Err(StageError::InvalidArgument(
                        "Unattended updates are disabled".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Release rule set for this policy, if versions are checked at all.
    pub fn selection_mode(&self) -> Option<SelectionMode> {
        match self {
            UpdatePolicy::Extensions => None,
            UpdatePolicy::CoreInteractive => Some(SelectionMode::Interactive),
            UpdatePolicy::CoreUnattended(mode) => Some(SelectionMode::Unattended(*mode)),
        }
    }

    pub fn is_unattended(&self) -> bool {
        matches!(self, UpdatePolicy::CoreUnattended(_))
    }
}
