//! `su -c` adapter for rooted devices.
//!
//! Commands are quoted into a single `sh` line and handed to the `su` binary.
//! When the process already runs as root the command is executed directly.
//! Output is captured on reader threads; the child is polled until it exits
//! or the timeout elapses, then terminated with SIGTERM → SIGKILL.

use super::{CommandOutput, CommandSpec, PrivilegedShell, ShellError};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

const SIGTERM_GRACE_MS: u64 = 500;

/// How root is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    /// Wrap every command in `<su_binary> -c '<line>'`.
    Su { su_binary: String },
    /// Execute directly (already root, or a host-side toolchain).
    Direct,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub mode: ShellMode,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            mode: ShellMode::Su {
                su_binary: "su".to_string(),
            },
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuShell {
    config: ShellConfig,
}

impl SuShell {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Direct mode when the effective uid is 0, `su` otherwise.
    pub fn detect() -> Self {
        let mode = if is_effective_root() {
            ShellMode::Direct
        } else {
            ShellMode::Su {
                su_binary: "su".to_string(),
            }
        };
        Self::new(ShellConfig {
            mode,
            ..ShellConfig::default()
        })
    }

    pub fn mode(&self) -> &ShellMode {
        &self.config.mode
    }

    fn validate(spec: &CommandSpec) -> Result<(), ShellError> {
        if spec.program.is_empty() {
            return Err(ShellError::InvalidCommand("empty program".to_string()));
        }
        if spec.program.contains(['|', '&', ';', '$', '`', '\n', '\r', ' ']) {
            return Err(ShellError::InvalidCommand(format!(
                "program contains shell metacharacters: {}",
                spec.program
            )));
        }
        Ok(())
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut command = match &self.config.mode {
            ShellMode::Su { su_binary } => {
                let mut c = Command::new(su_binary);
                c.arg("-c").arg(spec.quoted());
                c
            }
            ShellMode::Direct => {
                let mut c = Command::new(&spec.program);
                c.args(&spec.args);
                c
            }
        };
        command.env("LC_ALL", "C");
        command
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        command: &str,
        timeout: Duration,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), ShellError> {
        let max = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|s| spawn_reader(s, max));
        let stderr = child.stderr.take().map(|s| spawn_reader(s, max));

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    warn!(command, timeout_ms = timeout.as_millis() as u64, "command timed out");
                    kill_with_grace(child);
                    return Err(ShellError::Timeout {
                        command: command.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                None => thread::sleep(Duration::from_millis(10)),
            }
        };

        let out = stdout.map(join_reader).unwrap_or_default();
        let err = stderr.map(join_reader).unwrap_or_default();
        // Killed by a signal reads as 128 + signo, like a shell would report it.
        let code = status.code().unwrap_or_else(|| 128 + signal_of(&status));
        Ok((code, out, err))
    }
}

impl Default for SuShell {
    fn default() -> Self {
        Self::detect()
    }
}

impl PrivilegedShell for SuShell {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ShellError> {
        Self::validate(spec)?;
        let line = spec.command_line();
        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        debug!(command = %line, timeout_ms = timeout.as_millis() as u64, "running privileged command");

        let mut child = self
            .build_command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match (&self.config.mode, e.kind()) {
                (ShellMode::Su { su_binary }, std::io::ErrorKind::NotFound) => {
                    ShellError::Unavailable(format!("{} not found", su_binary))
                }
                _ => ShellError::SpawnFailed(format!("{}: {}", spec.program, e)),
            })?;

        let started = Instant::now();
        let (exit_code, stdout, stderr) = self.wait_with_timeout(&mut child, &line, timeout)?;
        trace!(
            command = %line,
            exit_code,
            duration_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn name(&self) -> &str {
        match self.config.mode {
            ShellMode::Su { .. } => "su",
            ShellMode::Direct => "direct",
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R, max: usize) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let space = max.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(space)]);
                }
            }
        }
        buf
    })
}

fn join_reader(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(unix)]
fn kill_with_grace(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + Duration::from_millis(SIGTERM_GRACE_MS);
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_with_grace(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> i32 {
    0
}

#[cfg(unix)]
fn is_effective_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_effective_root() -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn direct() -> SuShell {
        SuShell::new(ShellConfig {
            mode: ShellMode::Direct,
            ..ShellConfig::default()
        })
    }

    #[test]
    fn test_direct_mode_captures_output() {
        let out = direct()
            .run(&CommandSpec::new("echo", ["hello"]))
            .expect("echo runs");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.first_line(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_reported_not_raised() {
        let out = direct()
            .run(&CommandSpec::new("sh", ["-c", "echo oops >&2; exit 3"]))
            .expect("sh runs");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_timeout() {
        let spec = CommandSpec::new("sleep", ["5"]).with_timeout(Duration::from_millis(100));
        let err = direct().run(&spec).expect_err("must time out");
        assert!(matches!(err, ShellError::Timeout { .. }));
    }

    #[test]
    fn test_missing_su_binary_is_unavailable() {
        let shell = SuShell::new(ShellConfig {
            mode: ShellMode::Su {
                su_binary: "/nonexistent/romtools-su".to_string(),
            },
            ..ShellConfig::default()
        });
        let err = shell
            .run(&CommandSpec::new("id", ["-u"]))
            .expect_err("no su");
        assert!(matches!(err, ShellError::Unavailable(_)));
    }

    #[test]
    fn test_rejects_metacharacters_in_program() {
        let err = direct()
            .run(&CommandSpec::new("id;reboot", Vec::<String>::new()))
            .expect_err("rejected");
        assert!(matches!(err, ShellError::InvalidCommand(_)));
    }
}
