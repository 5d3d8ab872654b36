//! External command execution.
//!
//! The engine depends on the package manager only through exit status and
//! the manifest files it leaves behind. [`Stager`] is that seam; the
//! default [`ComposerStager`] shells out to a Composer executable.
//!
//! Commands run synchronously. Both pipes are drained on helper threads so
//! a chatty tool cannot block on a full pipe while we poll for exit.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, StageError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs the package manager inside a stage directory.
pub trait Stager {
    fn stage(&self, working_dir: &Path, args: &[String], timeout: Option<Duration>)
        -> Result<ToolOutput>;
}

/// Composer, invoked as a child process.
#[derive(Debug, Clone)]
pub struct ComposerStager {
    executable: PathBuf,
}

impl ComposerStager {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Stager for ComposerStager {
    fn stage(
        &self,
        working_dir: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        let mut full_args = args.to_vec();
        full_args.push("--no-interaction".to_string());
        run_command(&self.executable, &full_args, working_dir, timeout)
    }
}

fn describe(program: &Path, args: &[String]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut output = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                output = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        output
    })
}

/// Runs `program args...` in `working_dir`. Non-zero exit is a
/// `ToolInvocation` error carrying stderr; exceeding `timeout` kills the
/// child and returns `Timeout`.
pub fn run_command(
    program: &Path,
    args: &[String],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<ToolOutput> {
    let command_line = describe(program, args);
    debug!(command = %command_line, dir = %working_dir.display(), "Running command");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StageError::ToolInvocation {
            command: command_line.clone(),
            details: format!("failed to start: {e}"),
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let start = Instant::now();

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(limit) = timeout {
                    if start.elapsed() > limit {
                        warn!(command = %command_line, seconds = limit.as_secs(), "Command timed out");
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(StageError::Timeout {
                            operation: command_line,
                            seconds: limit.as_secs(),
                        });
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(StageError::io(format!("Failed to wait for {command_line}"), err));
            }
        }
    };

    let output = ToolOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };

    if !status.success() {
        let details = match output.stderr.trim() {
            "" => format!("exited with {status}"),
            stderr => format!("exited with {status}: {stderr}"),
        };
        return Err(StageError::ToolInvocation {
            command: command_line,
            details,
        });
    }

    info!(
        command = %command_line,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Command finished"
    );
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn captures_stdout() {
        let tmp = TempDir::new().unwrap();
        let output = run_command(Path::new("sh"), &sh("echo hello"), tmp.path(), None).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn runs_in_working_dir() {
        let tmp = TempDir::new().unwrap();
        run_command(Path::new("sh"), &sh("touch marker"), tmp.path(), None).unwrap();
        assert!(tmp.path().join("marker").exists());
    }

    #[test]
    fn non_zero_exit_is_tool_error() {
        let tmp = TempDir::new().unwrap();
        let err =
            run_command(Path::new("sh"), &sh("echo broken >&2; exit 3"), tmp.path(), None)
                .unwrap_err();
        match err {
            StageError::ToolInvocation { details, .. } => assert!(details.contains("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_is_tool_error() {
        let tmp = TempDir::new().unwrap();
        let err = run_command(Path::new("definitely-not-a-real-tool"), &[], tmp.path(), None)
            .unwrap_err();
        assert!(matches!(err, StageError::ToolInvocation { .. }));
    }

    #[test]
    fn timeout_kills_child() {
        let tmp = TempDir::new().unwrap();
        let err = run_command(
            Path::new("sh"),
            &sh("sleep 5"),
            tmp.path(),
            Some(Duration::from_millis(100)),
        )
        .unwrap_err();
        assert!(matches!(err, StageError::Timeout { .. }));
    }
}
