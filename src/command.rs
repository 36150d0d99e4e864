//! Shell-command execution for native networking tools
//!
//! Every backend talks to the kernel through a native tool (`iptables-save`,
//! `ipset`, `ip`, ...). This module owns how those tools are run:
//!
//! - [`Invocation`]: program, arguments and optional stdin
//! - [`CommandRunner`]: the seam tests replace with a recording mock
//! - [`SystemRunner`]: blocking `std::process` implementation
//! - [`Executor`]: splits read-only queries from mutating commands so that
//!   mutations are logged and written to the audit log

use crate::audit::{AuditEvent, AuditLog};
use crate::core::error::{Error, Result};
use crate::elevation::{self, ElevationMethod};
use std::fmt;
use std::io::Write;
use std::process::Stdio;
use tracing::{error, info, warn};

/// A single native tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs native tools.
///
/// Implementations must report a non-zero exit as [`Error::ExternalTool`]
/// carrying the command line and the combined output.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Production [`CommandRunner`] that spawns real processes and blocks until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    elevation: ElevationMethod,
}

impl SystemRunner {
    pub fn new(elevation: ElevationMethod) -> Self {
        Self { elevation }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut cmd =
            elevation::build_command(self.elevation, &invocation.program, &invocation.args)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if invocation.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            command: invocation.to_string(),
            source,
        })?;

        // A tool that exits early closes its stdin; its exit status and
        // output explain more than the resulting broken pipe.
        let written = match (&invocation.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => stdin.write_all(input.as_bytes()),
            _ => Ok(()),
        };

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if output.status.success() {
            if !result.stderr.trim().is_empty() {
                warn!(cmd = %invocation, stderr = %result.stderr.trim(), "Non empty stderr on successful command");
            }
            written?;
            Ok(result)
        } else {
            let combined = result.combined();
            error!(cmd = %invocation, status_code = ?output.status.code(), output = %combined.trim(), "Error executing command");
            Err(Error::ExternalTool {
                command: invocation.to_string(),
                exit_code: output.status.code(),
                output: combined,
            })
        }
    }
}

/// Runs invocations on behalf of the reconcilers.
pub struct Executor {
    runner: Box<dyn CommandRunner>,
    audit: Option<AuditLog>,
}

impl Executor {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Runs a read-only command (state dumps) and returns its stdout.
    pub fn query(&self, invocation: &Invocation) -> Result<String> {
        Ok(self.runner.run(invocation)?.stdout)
    }

    /// Runs a command that changes kernel state.
    pub fn mutate(&self, backend: &str, invocation: &Invocation) -> Result<CommandOutput> {
        info!(backend, cmd = %invocation, "Running");
        let result = self.runner.run(invocation);

        if let Some(audit) = &self.audit {
            let event = AuditEvent::new(
                backend,
                invocation.to_string(),
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            );
            if let Err(e) = audit.log(&event) {
                warn!(path = %audit.path().display(), "Failed to write audit log: {e}");
            }
        }

        result
    }
}
