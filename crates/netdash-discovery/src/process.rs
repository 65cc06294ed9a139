//! External command execution with a sanitized environment and a hard timeout

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

const SAFE_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin:/opt/homebrew/bin";

/// Captured result of a command run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the command could not be started, timed out,
    /// or was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Sentinel for a command that never produced an exit status
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }

    /// Successful exit with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout of a successful run with non-blank output
    pub fn stdout_if_ok(&self) -> Option<&str> {
        if self.success() && !self.stdout.trim().is_empty() {
            Some(&self.stdout)
        } else {
            None
        }
    }
}

/// Run `argv` and capture its output.
///
/// The child gets a minimal environment (`PATH`, C.UTF-8 locale) so tool
/// output is parseable, no stdin, and is killed if `timeout` elapses. Never
/// returns an error: spawn failures and timeouts become [`CommandOutput::failed`].
pub async fn run_command(argv: &[&str], timeout: Duration) -> CommandOutput {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutput::failed("empty command");
    };

    let path = std::env::var("PATH").unwrap_or_else(|_| SAFE_PATH.to_string());
    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .env("PATH", path)
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Windows tools need these to locate system DLLs and PowerShell modules
    #[cfg(windows)]
    for key in ["SystemRoot", "windir", "PSModulePath"] {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }

    trace!(command = ?argv, "Running command");

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(command = %program, error = %e, "Failed to spawn command");
            return CommandOutput::failed(e.to_string());
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if !result.success() {
                trace!(command = %program, status = ?result.status, stderr = %result.stderr.trim(), "Command failed");
            }
            result
        }
        Ok(Err(e)) => {
            debug!(command = %program, error = %e, "Failed to collect command output");
            CommandOutput::failed(e.to_string())
        }
        Err(_) => {
            debug!(command = %program, timeout_ms = timeout.as_millis() as u64, "Command timed out");
            CommandOutput::failed("timeout")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_soft_failure() {
        let out = run_command(&["netdash-no-such-binary"], Duration::from_secs(2)).await;
        assert!(!out.success());
        assert_eq!(out.status, None);
    }

    #[tokio::test]
    async fn test_empty_argv() {
        let out = run_command(&[], Duration::from_secs(1)).await;
        assert_eq!(out.stderr, "empty command");
    }

    #[test]
    fn test_stdout_if_ok() {
        assert_eq!(CommandOutput::ok("x\n").stdout_if_ok(), Some("x\n"));
        assert_eq!(CommandOutput::ok("  \n").stdout_if_ok(), None);
        assert_eq!(CommandOutput::failed("timeout").stdout_if_ok(), None);
    }
}
