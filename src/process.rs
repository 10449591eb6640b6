//! Thin wrapper around [`std::process::Command`] that captures stdout/stderr
//! and keeps them even after the child exits with a failing status, per the
//! "drain both streams to EOF before reporting the return code" requirement
//! for stage execution.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A command to run with captured output, built up with `arg`/`env`/`current_dir`.
pub struct Cmd {
    inner: Command,
}

impl Cmd {
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        let mut inner = Command::new(program);
        inner.stdin(Stdio::null());
        Cmd { inner }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.inner.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn env(mut self, key: impl AsRef<std::ffi::OsStr>, val: impl AsRef<std::ffi::OsStr>) -> Self {
        self.inner.env(key, val);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.current_dir(dir);
        self
    }

    /// Run to completion, capturing stdout/stderr regardless of exit status.
    pub fn run(mut self) -> Result<CommandResult> {
        self.inner.stdout(Stdio::piped());
        self.inner.stderr(Stdio::piped());
        let output = self
            .inner
            .output()
            .with_context(|| "failed to spawn child process")?;
        let status = output.status.code().unwrap_or(-1);
        Ok(CommandResult {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Returns `true` if `cmd` resolves on `$PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Return the first of `candidates` that exists on `$PATH`, if any.
pub fn find_first_existing(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|c| command_exists(c))
        .map(|c| c.to_string())
}

/// Ensure all required tools are present; fail fast naming every missing one.
pub fn ensure_exists(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools.iter().copied().filter(|t| !command_exists(t)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("missing required tools: {}", missing.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn true_command_succeeds() {
        let result = Cmd::new("true").run().unwrap();
        assert!(result.success());
    }

    #[test]
    fn false_command_captures_failure() {
        let result = Cmd::new("false").run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn find_first_existing_skips_missing() {
        let found = find_first_existing(&["definitely-not-a-real-binary-xyz", "true"]);
        assert_eq!(found.as_deref(), Some("true"));
    }
}
