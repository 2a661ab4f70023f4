//! Command execution abstraction for rsprovision.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Result of command execution
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//! - [`CommandRunner`]: Executor handle that turns non-zero exits into errors

mod pipe;
mod real;

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::error::ProvisionError;

pub use real::RealCommandExecutor;

/// Formats a command and its arguments for logs and error messages
/// (e.g., `apt-get "install" "postfix"`).
pub(crate) fn format_command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }
    let args = args
        .iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {}", command, args)
}

/// Specification for a command to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The command to execute (e.g., "apt-get")
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// Kill the command if it runs longer than this
    pub timeout: Option<Duration>,
    /// Keep stdout/stderr in the result in addition to logging them
    pub capture_output: bool,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: Vec::new(),
            timeout: None,
            capture_output: false,
        }
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the timeout after which the command is killed
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests stdout/stderr to be captured into the [`ExecutionResult`]
    #[must_use]
    pub fn capturing_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    /// Returns `true` if any argument equals `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Returns the command line formatted for display.
    pub fn display(&self) -> String {
        format_command_line(&self.command, &self.args)
    }
}

/// Output captured from a command run with [`CommandSpec::capturing_output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Iterates over the lines of stdout followed by stderr.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }
}

/// Result of command execution
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode)
    pub status: Option<ExitStatus>,
    /// Captured output, present only when the spec asked for it
    pub output: Option<CapturedOutput>,
}

impl ExecutionResult {
    /// Creates a result without captured output.
    pub fn new(status: Option<ExitStatus>) -> Self {
        Self {
            status,
            output: None,
        }
    }

    /// Attaches captured output.
    #[must_use]
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.output = Some(CapturedOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
        self
    }

    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so the executor can be shared
/// as `Arc<dyn CommandExecutor>` between the components of a run.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}

/// Shared executor handle used by the provisioning components.
///
/// Wraps a [`CommandExecutor`] and turns unsuccessful results into
/// [`ProvisionError::CommandFailure`], so callers only ever see commands
/// that succeeded (or were skipped by a dry run).
#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, dry_run: bool) -> Self {
        Self { executor, dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs the command and fails on a non-zero exit status.
    pub fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let result = self.run_unchecked(spec)?;
        check_execution_result(&result, spec, self.dry_run)?;
        Ok(result)
    }

    /// Runs the command and returns its result whatever the exit status.
    ///
    /// Errors are still returned when the command cannot be started.
    pub fn run_unchecked(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        tracing::debug!("running: {}", spec.display());
        self.executor.execute(spec)
    }
}

/// Checks the execution result and returns an error if the command failed.
///
/// Handles three cases:
/// - Non-zero exit status: returns `CommandFailure` with the status
/// - No exit status outside a dry run: returns `CommandFailure` (e.g., killed by signal)
/// - Success, or dry run with no status: returns `Ok(())`
pub(crate) fn check_execution_result(
    result: &ExecutionResult,
    spec: &CommandSpec,
    dry_run: bool,
) -> Result<(), ProvisionError> {
    match result.status {
        Some(status) if !status.success() => Err(ProvisionError::command_failure(
            &spec.command,
            &spec.args,
            status.to_string(),
        )),
        None if !dry_run => Err(ProvisionError::command_failure(
            &spec.command,
            &spec.args,
            "process exited without status (possibly killed by signal)",
        )),
        _ => Ok(()),
    }
}
