//! Privileged command execution boundary.
//!
//! Every device interaction that needs root goes through [`PrivilegedShell`].
//! The trait is narrow: one command in, exit code and captured
//! output out. How root is obtained is the implementation's business.
//!
//! [`SuShell`] is the adapter used on real devices; tests use the scripted
//! doubles in `test_utils`.

mod su;

pub use su::{ShellConfig, ShellMode, SuShell};

use std::time::Duration;
use thiserror::Error;

/// Errors from the privileged shell itself (not from the command it ran).
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("privileged shell unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("command `{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single command to run with elevated privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides the shell's default timeout.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Space-joined command line, unquoted. Used for logs and test matching.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Command line with every word single-quoted for `sh -c`.
    pub fn quoted(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First line of stdout, trimmed.
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

/// The root primitive.
///
/// Implementations must be usable from the worker thread, hence `Send + Sync`.
pub trait PrivilegedShell: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ShellError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "shell"
    }
}

/// A command exited non-zero.
#[derive(Debug, Error)]
#[error("command `{command}` exited with status {exit_code}: {stderr}")]
pub struct CommandFailed {
    pub command: String,
    pub exit_code: i32,
    pub stderr: String,
}

impl From<CommandFailed> for rt_common::Error {
    fn from(err: CommandFailed) -> Self {
        rt_common::Error::Execution {
            command: err.command,
            exit_code: err.exit_code,
            stderr: err.stderr,
        }
    }
}

/// Outcome of [`run_checked`]: either the shell failed or the command did.
#[derive(Debug, Error)]
pub enum CheckedError {
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Failed(#[from] CommandFailed),
}

/// Run a command and treat a non-zero exit as an error.
pub fn run_checked(
    shell: &dyn PrivilegedShell,
    spec: &CommandSpec,
) -> Result<CommandOutput, CheckedError> {
    let output = shell.run(spec)?;
    if output.success() {
        Ok(output)
    } else {
        Err(CommandFailed {
            command: spec.command_line(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
        .into())
    }
}

/// `getprop <name>`, trimmed. A missing property reads as an empty string.
pub fn getprop(shell: &dyn PrivilegedShell, name: &str) -> Result<String, ShellError> {
    let output = shell.run(&CommandSpec::new("getprop", [name]))?;
    if output.success() {
        Ok(output.first_line().to_string())
    } else {
        Ok(String::new())
    }
}

/// Quote a word for POSIX `sh`.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("getprop", ["ro.product.model"]);
        assert_eq!(spec.command_line(), "getprop ro.product.model");
        assert_eq!(CommandSpec::new("getenforce", Vec::<String>::new()).command_line(), "getenforce");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/dev/block/by-name/boot"), "/dev/block/by-name/boot");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
    }

    #[test]
    fn test_quoted_command() {
        let spec = CommandSpec::new("cp", ["/sdcard/my app.apk", "/data/local/rt"]);
        assert_eq!(spec.quoted(), "cp '/sdcard/my app.apk' /data/local/rt");
    }

    #[test]
    fn test_output_first_line() {
        let out = CommandOutput::ok("  Pixel 7 \nsecond\n");
        assert_eq!(out.first_line(), "Pixel 7");
        assert!(out.success());
        assert!(!CommandOutput::failed(1, "nope").success());
    }
}
