//! stagectl - drive staged package updates from the command line.
//!
//! Each invocation is one process, so multi-step flows hand the stage over
//! between runs with `claim`: `begin` prints the stage id and owner token,
//! later commands pass both back.

mod logging;

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use stage_core::events::overall_severity;
use stage_core::validators::VersionPolicyValidator;
use stage_core::{
    AvailableReleases, CopyDirection, OwnerToken, PackageVersions, RunOutcome, Severity,
    StageConfig, StageError, StageId, StageLifecycle, TracingNotifier, UnattendedRunner,
    UpdatePolicy, ValidationResult,
};
use thiserror::Error;

const OWNER_ENV: &str = "STAGECTL_OWNER";
const CONFIG_FILE_NAME: &str = "stage.toml";

#[derive(Parser)]
#[command(name = "stagectl")]
#[command(about = "Stage, validate and apply package updates without touching the live site until the end")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root; overrides the configuration file.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Owner token of the session. Falls back to $STAGECTL_OWNER.
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Treat the update as a core update instead of an extension update.
    #[arg(long, global = true)]
    core: bool,

    /// Seconds allowed for each long-running step.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stage state and run the status checks
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create a stage for the given `vendor/name:version` packages
    Begin {
        packages: Vec<String>,
        #[arg(long = "dev")]
        dev: Vec<String>,
        /// Release feed (JSON) used to check core targets.
        #[arg(long)]
        releases: Option<PathBuf>,
    },

    /// Verify ownership of an existing stage
    Claim { stage_id: String },

    /// Run the package manager inside the stage
    Require {
        stage_id: String,
        packages: Vec<String>,
        #[arg(long = "dev")]
        dev: Vec<String>,
    },

    /// Copy the stage back over the live codebase
    Apply { stage_id: String },

    /// Run the configured post-apply steps
    PostApply { stage_id: String },

    /// Remove the stage and release the lock
    Destroy {
        /// Stage to destroy; required unless --force.
        stage_id: Option<String>,
        /// Destroy without ownership, even mid-apply.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        message: Option<String>,
    },

    /// Begin, require, apply, post-apply and destroy in one go
    Update {
        packages: Vec<String>,
        #[arg(long = "dev")]
        dev: Vec<String>,
        #[arg(long)]
        releases: Option<PathBuf>,
    },

    /// Unattended core update against a release feed
    Cron {
        #[arg(long)]
        releases: PathBuf,
    },

    /// List the paths excluded from a bulk copy
    Exclusions {
        #[arg(long, value_enum, default_value_t = Direction::IntoStage)]
        direction: Direction,
    },

    /// Remove the failure marker after the codebase was restored by hand
    ClearFailure,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    IntoStage,
    BackToActive,
}

impl From<Direction> for CopyDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::IntoStage => CopyDirection::IntoStage,
            Direction::BackToActive => CopyDirection::BackToActive,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("An owner token is required: pass --owner or set {OWNER_ENV}")]
    MissingOwner,

    #[error("Failed to determine the working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),

    #[error("Failed to encode status: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Status check reported errors")]
    StatusErrors,
}

type CliResult<T> = std::result::Result<T, CliError>;

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            let _logging_guard = logging::init(None);
            tracing::error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(Some(config.storage().logs_dir()));

    if let Err(e) = run(&cli, config) {
        tracing::error!(error = %e, "stagectl failed");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config: StageConfig) -> CliResult<()> {
    let timeout = cli.timeout.map(Duration::from_secs);

    match &cli.command {
        Commands::Status { json } => status(lifecycle(cli, config, true)?, *json),
        Commands::Begin {
            packages,
            dev,
            releases,
        } => {
            let desired = desired_versions(packages, dev)?;
            let mut stage = with_releases(lifecycle(cli, config, true)?, releases.as_deref())?;
            let stage_id = stage.begin(desired, timeout)?;
            println!("stage_id: {stage_id}");
            println!("owner: {}", stage.owner().as_str());
            Ok(())
        }
        Commands::Claim { stage_id } => {
            let mut stage = lifecycle(cli, config, false)?;
            let record = stage.claim(&StageId::from(stage_id.as_str()))?;
            println!("{} {}", record.stage_id, record.phase);
            Ok(())
        }
        Commands::Require {
            stage_id,
            packages,
            dev,
        } => {
            let mut stage = claimed(cli, config, stage_id)?;
            let runtime = PackageVersions::parse_pairs(packages.iter().map(String::as_str))?;
            let dev = PackageVersions::parse_pairs(dev.iter().map(String::as_str))?;
            stage.require(runtime, dev, timeout)?;
            println!("{}", stage.phase());
            Ok(())
        }
        Commands::Apply { stage_id } => {
            let mut stage = claimed(cli, config, stage_id)?;
            stage.apply(timeout)?;
            println!("{}", stage.phase());
            Ok(())
        }
        Commands::PostApply { stage_id } => {
            let mut stage = claimed(cli, config, stage_id)?;
            stage.post_apply(timeout)?;
            println!("{}", stage.phase());
            Ok(())
        }
        Commands::Destroy {
            stage_id,
            force,
            message,
        } => {
            let mut stage = match (stage_id, *force) {
                (Some(stage_id), false) => claimed(cli, config, stage_id)?,
                (None, false) => {
                    return Err(StageError::InvalidArgument(
                        "A stage id is required unless --force is given".to_string(),
                    )
                    .into())
                }
                (_, true) => lifecycle(cli, config, true)?,
            };
            stage.destroy(*force, message.as_deref())?;
            println!("destroyed");
            Ok(())
        }
        Commands::Update {
            packages,
            dev,
            releases,
        } => {
            let desired = desired_versions(packages, dev)?;
            let mut stage = with_releases(lifecycle(cli, config, true)?, releases.as_deref())?;
            full_update(&mut stage, desired, timeout)
        }
        Commands::Cron { releases } => cron(cli, config, releases),
        Commands::Exclusions { direction } => {
            let stage = lifecycle(cli, config, true)?;
            for path in stage.collect_exclusions((*direction).into())?.iter() {
                println!("{path}");
            }
            Ok(())
        }
        Commands::ClearFailure => {
            let stage = lifecycle(cli, config, true)?;
            stage.failure_marker().clear()?;
            println!("cleared");
            Ok(())
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Explicit --config, then ./stage.toml, then the user config directory,
/// then defaults for the project root.
fn load_config(cli: &Cli) -> CliResult<StageConfig> {
    let cwd = env::current_dir().map_err(CliError::WorkingDirectory)?;

    let candidate = match &cli.config {
        Some(path) => Some(path.clone()),
        None => [
            Some(cwd.join(CONFIG_FILE_NAME)),
            dirs::config_dir().map(|dir| dir.join("stagectl").join(CONFIG_FILE_NAME)),
        ]
        .into_iter()
        .flatten()
        .find(|path| path.is_file()),
    };

    let mut config = match candidate {
        Some(path) => StageConfig::load(&path)?,
        None => StageConfig::for_project(cli.project_root.clone().unwrap_or_else(|| cwd.clone())),
    };
    if let Some(root) = &cli.project_root {
        config.project_root = if root.is_absolute() {
            root.clone()
        } else {
            cwd.join(root)
        };
    }
    Ok(config)
}

// ─── Lifecycle construction ──────────────────────────────────────────────────

fn policy(cli: &Cli) -> UpdatePolicy {
    if cli.core {
        UpdatePolicy::CoreInteractive
    } else {
        UpdatePolicy::Extensions
    }
}

/// With `allow_new_owner`, a missing token is generated instead of rejected.
fn lifecycle(cli: &Cli, config: StageConfig, allow_new_owner: bool) -> CliResult<StageLifecycle> {
    let owner = match cli.owner.clone().or_else(|| env::var(OWNER_ENV).ok()) {
        Some(token) => OwnerToken::from(token),
        None if allow_new_owner => OwnerToken::generate(),
        None => return Err(CliError::MissingOwner),
    };
    Ok(StageLifecycle::new(config, policy(cli), owner)?)
}

fn claimed(cli: &Cli, config: StageConfig, stage_id: &str) -> CliResult<StageLifecycle> {
    let mut stage = lifecycle(cli, config, false)?;
    stage.claim(&StageId::from(stage_id))?;
    Ok(stage)
}

fn with_releases(stage: StageLifecycle, releases: Option<&Path>) -> CliResult<StageLifecycle> {
    Ok(match releases {
        Some(path) => stage.with_validator(VersionPolicyValidator::new(AvailableReleases::load(path)?)),
        None => stage,
    })
}

fn desired_versions(packages: &[String], dev: &[String]) -> CliResult<PackageVersions> {
    let runtime = PackageVersions::parse_pairs(packages.iter().map(String::as_str))?;
    let dev = PackageVersions::parse_pairs(dev.iter().map(String::as_str))?;
    Ok(PackageVersions { runtime, dev })
}

// ─── Commands ────────────────────────────────────────────────────────────────

fn full_update(
    stage: &mut StageLifecycle,
    desired: PackageVersions,
    timeout: Option<Duration>,
) -> CliResult<()> {
    let runtime: BTreeMap<String, String> = desired.runtime.clone();
    let dev = desired.dev.clone();

    let stage_id = stage.begin(desired, timeout)?;
    let result = stage
        .require(runtime, dev, timeout)
        .and_then(|()| stage.apply(timeout));

    if let Err(err) = result {
        // A failed copy-back keeps its stage for inspection.
        if !matches!(err, StageError::ApplyFailed { .. }) {
            if let Err(destroy_err) = stage.destroy(true, Some("update failed")) {
                tracing::warn!(error = %destroy_err, "Failed to clean up stage");
            }
        }
        return Err(err.into());
    }

    let post_apply = stage.post_apply(timeout);
    stage.destroy(false, None)?;
    post_apply?;
    println!("updated ({stage_id})");
    Ok(())
}

fn cron(cli: &Cli, mut config: StageConfig, releases: &Path) -> CliResult<()> {
    let releases = AvailableReleases::load(releases)?;
    let mode = config.unattended_mode;
    config.tool_timeout_secs = cli.timeout.or(config.tool_timeout_secs);

    let stage = StageLifecycle::new(
        config,
        UpdatePolicy::CoreUnattended(mode),
        OwnerToken::generate(),
    )?
    .with_validator(VersionPolicyValidator::new(releases.clone()));

    let notifier = TracingNotifier;
    let mut runner = UnattendedRunner::new(stage, &notifier)?;
    match runner.run(&releases)? {
        RunOutcome::Skipped(reason) => println!("skipped: {reason:?}"),
        RunOutcome::Updated { package, from, to, .. } => println!("updated {package} {from} -> {to}"),
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    project_root: PathBuf,
    available: bool,
    applying: bool,
    stage_id: Option<String>,
    phase: Option<String>,
    created_at: Option<DateTime<Utc>>,
    failure_marker: Option<String>,
    checks: Vec<CheckReport>,
}

#[derive(Serialize)]
struct CheckReport {
    severity: String,
    summary: Option<String>,
    messages: Vec<String>,
}

impl From<&ValidationResult> for CheckReport {
    fn from(result: &ValidationResult) -> Self {
        Self {
            severity: result.severity.to_string(),
            summary: result.summary.clone(),
            messages: result.messages.clone(),
        }
    }
}

fn status(stage: StageLifecycle, json: bool) -> CliResult<()> {
    let record = stage.active_record()?;
    let results = stage.status_check()?;
    let report = StatusReport {
        project_root: stage.config().project_root.clone(),
        available: stage.is_available()?,
        applying: stage.is_applying()?,
        stage_id: record.as_ref().map(|r| r.stage_id.to_string()),
        phase: record.as_ref().map(|r| r.phase.to_string()),
        created_at: record.as_ref().map(|r| r.created_at),
        failure_marker: stage.failure_marker().read()?.map(|m| m.message),
        checks: results.iter().map(CheckReport::from).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("project: {}", report.project_root.display());
        match (&report.stage_id, &report.phase) {
            (Some(id), Some(phase)) => println!("stage: {id} ({phase})"),
            _ => println!("stage: none"),
        }
        if let Some(message) = &report.failure_marker {
            println!("failure marker: {message}");
        }
        for check in &report.checks {
            let label = check.summary.as_deref().unwrap_or("");
            println!("[{}] {label}", check.severity);
            for message in &check.messages {
                println!("  - {message}");
            }
        }
    }

    if overall_severity(&results) == Severity::Error {
        return Err(CliError::StatusErrors);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_begin_with_dev_packages() {
        let cli = Cli::try_parse_from([
            "stagectl",
            "--core",
            "begin",
            "drupal/core:10.1.2",
            "--dev",
            "drupal/core-dev:10.1.2",
        ])
        .unwrap();
        assert!(cli.core);
        let Commands::Begin { packages, dev, .. } = &cli.command else {
            panic!("expected begin");
        };
        let desired = desired_versions(packages, dev).unwrap();
        assert_eq!(desired.get("drupal/core"), Some("10.1.2"));
        assert_eq!(desired.dev.get("drupal/core-dev").map(String::as_str), Some("10.1.2"));
    }

    #[test]
    fn rejects_package_without_version() {
        let err = desired_versions(&["drupal/token".to_string()], &[]).unwrap_err();
        assert!(matches!(err, CliError::Stage(StageError::InvalidArgument(_))));
    }

    #[test]
    fn project_root_flag_overrides_config() {
        let cli = Cli::try_parse_from(["stagectl", "--project-root", "/srv/site", "status"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/site"));
    }

    #[test]
    fn exclusion_direction_parses_kebab_case() {
        let cli =
            Cli::try_parse_from(["stagectl", "exclusions", "--direction", "back-to-active"]).unwrap();
        let Commands::Exclusions { direction } = cli.command else {
            panic!("expected exclusions");
        };
        assert_eq!(CopyDirection::from(direction), CopyDirection::BackToActive);
    }
}
