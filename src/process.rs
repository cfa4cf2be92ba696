//! Centralized command execution with consistent error handling.
//!
//! Short queries (`lsblk`, `md5sum`) capture their output. Long-running
//! steps (unsquashfs, the installer, mksquashfs, xorriso) stream into the
//! build log and register with the interrupt handle so an operator signal
//! reaches them.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::build::BuildLog;
use crate::error::BuildError;
use crate::interrupt::Interrupt;

/// Exit status and captured output of a short query.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 when a signal ended the child.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// External command builder.
///
/// Nonzero exit is an error unless `allow_fail` is set; the error carries
/// stderr (captured runs) or the build log path (logged runs).
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path argument (converted lossily to UTF-8).
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Return the status instead of failing on nonzero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Replace the default "'prog' failed" prefix of error messages.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Command line as it would be typed, for log lines.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn failure_prefix(&self) -> String {
        self.error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program))
    }

    /// Run to completion with stdout and stderr captured.
    pub fn run(self) -> Result<CommandResult> {
        debug!(command = %self.display(), "Running");
        let output = self
            .command()
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self.failure_prefix();
            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }

    /// Run with inherited stdio so the operator sees progress (downloads).
    pub fn run_interactive(self) -> Result<ExitStatus> {
        debug!(command = %self.display(), "Running interactively");
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if !self.allow_fail && !status.success() {
            bail!(
                "{} (exit code {})",
                self.failure_prefix(),
                status.code().unwrap_or(-1)
            );
        }

        Ok(status)
    }

    /// Run with stdout/stderr streamed into the build log.
    ///
    /// The child is registered with `interrupt` while it runs. If the build
    /// was cancelled by the time it exits, this returns `Cancelled` whatever
    /// the exit status was.
    pub fn run_logged(self, log: &BuildLog, interrupt: &Interrupt) -> Result<ExitStatus> {
        interrupt.check()?;

        let line = self.display();
        debug!(command = %line, "Running (output to build log)");
        log.note(&format!("$ {}", line))?;

        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        let status = {
            let _registration = interrupt.register_child(child.id());
            child
                .wait()
                .with_context(|| format!("Failed waiting for '{}'", self.program))?
        };

        if interrupt.is_cancelled() {
            return Err(BuildError::Cancelled.into());
        }

        if !self.allow_fail && !status.success() {
            bail!(
                "{} (exit code {}, see {})",
                self.failure_prefix(),
                status.code().unwrap_or(-1),
                log.path().display()
            );
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_captured_stdout() {
        let result = Cmd::new("printf").arg("kt7run\\n").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "kt7run");
    }

    #[test]
    fn test_failure_message_carries_stderr() {
        let missing = Path::new("/nonexistent/casper/filesystem.squashfs");
        let err = Cmd::new("ls").arg_path(missing).run().unwrap_err();
        assert!(err.to_string().contains("filesystem.squashfs"));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Squashfs step failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("Squashfs step failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_env_is_passed_to_child() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $STATIONISO_ROOT"])
            .env("STATIONISO_ROOT", "/work/squashfs-root")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "/work/squashfs-root");
    }

    #[test]
    fn test_run_logged_streams_output_into_log() {
        let temp = TempDir::new().unwrap();
        let log = BuildLog::open(&temp.path().join("build.log")).unwrap();
        let interrupt = Interrupt::new();

        Cmd::new("sh")
            .args(["-c", "echo to-stdout; echo to-stderr >&2"])
            .run_logged(&log, &interrupt)
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("$ sh -c"));
        assert!(content.contains("to-stdout"));
        assert!(content.contains("to-stderr"));
    }

    #[test]
    fn test_run_logged_refuses_to_start_after_cancel() {
        let temp = TempDir::new().unwrap();
        let log = BuildLog::open(&temp.path().join("build.log")).unwrap();
        let interrupt = Interrupt::new();
        interrupt.trigger(libc::SIGINT);

        let err = Cmd::new("true").run_logged(&log, &interrupt).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Cancelled)
        ));
    }

    #[test]
    fn test_run_logged_failure_points_at_log() {
        let temp = TempDir::new().unwrap();
        let log = BuildLog::open(&temp.path().join("build.log")).unwrap();
        let interrupt = Interrupt::new();

        let err = Cmd::new("false").run_logged(&log, &interrupt).unwrap_err();
        assert!(err.to_string().contains("build.log"));
    }
}
