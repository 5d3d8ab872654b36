//! Follow-up work after staged changes land in the live codebase.
//!
//! Steps run in registration order. A failing step does not stop the
//! remaining ones; the lifecycle reports the first failure once all of them
//! have been attempted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StageError};
use crate::tool;

pub trait PostApplyStep {
    fn name(&self) -> String;

    fn run(&self, project_root: &Path, timeout: Option<Duration>) -> Result<()>;
}

/// Runs a configured command (e.g. a database update script) in the
/// project root.
#[derive(Debug, Clone)]
pub struct CommandStep {
    argv: Vec<String>,
}

impl CommandStep {
    /// `argv[0]` is the program. Empty vectors are rejected.
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(StageError::InvalidArgument(
                "Post-apply command must name a program".to_string(),
            ));
        }
        Ok(Self { argv })
    }
}

impl PostApplyStep for CommandStep {
    fn name(&self) -> String {
        self.argv.join(" ")
    }

    fn run(&self, project_root: &Path, timeout: Option<Duration>) -> Result<()> {
        let (program, args) = match self.argv.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        tool::run_command(&PathBuf::from(program), args, project_root, timeout).map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_command_rejected() {
        assert!(CommandStep::new(Vec::new()).is_err());
        assert!(CommandStep::new(vec![" ".to_string()]).is_err());
    }

    #[test]
    fn runs_in_project_root() {
        let tmp = TempDir::new().unwrap();
        let step = CommandStep::new(vec!["touch".into(), "updated".into()]).unwrap();
        assert_eq!(step.name(), "touch updated");
        step.run(tmp.path(), None).unwrap();
        assert!(tmp.path().join("updated").exists());
    }
}
