//! External command execution.
//!
//! Every tool the pipeline runs (package managers, hook scripts, `setcap`)
//! goes through [`Cmd`], so failures carry the command line and its output.
//! Commands block until the child exits; there is no timeout.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Builder around [`std::process::Command`].
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    env: Option<BTreeMap<String, String>>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: None,
            current_dir: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Run with exactly this environment (the inherited one is cleared).
    pub fn env_exact(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env = Some(env.clone());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Message prefixed to the failure when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Human-readable command line.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run and capture output; non-zero exit is an error carrying stdout/stderr.
    pub fn run(&self) -> Result<Output> {
        debug!("running: {}", self.display());
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning '{}'", self.display()))?;

        if output.status.success() {
            return Ok(output);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let prefix = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.display()));
        bail!(
            "{} ({}): {}\n{}",
            prefix,
            describe_status(&output),
            stdout.trim(),
            stderr.trim()
        )
    }

    /// Run with inherited stdout/stderr so long-running tools show progress.
    pub fn run_interactive(&self) -> Result<()> {
        debug!("running: {}", self.display());
        let status = self
            .command()
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("spawning '{}'", self.display()))?;
        if status.success() {
            return Ok(());
        }
        let prefix = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.display()));
        match status.code() {
            Some(code) => bail!("{} (exited with status {})", prefix, code),
            None => bail!("{} (terminated by signal)", prefix),
        }
    }
}

fn describe_status(output: &Output) -> String {
    match output.status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    }
}
