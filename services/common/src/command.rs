//! External command wrapper used for the camera, HDR, FFmpeg and streamer tools.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ExternalToolError {
    #[error("{program} not found in system PATH")]
    NotInstalled { program: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// Builder for a single external tool invocation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
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

    /// `-flag value` pair.
    pub fn option(self, flag: &str, value: impl AsRef<OsStr>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn path(self, path: impl AsRef<Path>) -> Self {
        self.arg(path.as_ref().as_os_str())
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ExternalToolError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ExternalToolError::NotInstalled {
                program: self.program.clone(),
            }
        } else {
            ExternalToolError::Io {
                program: self.program.clone(),
                source,
            }
        }
    }

    /// Run to completion and capture output. A non-zero exit is an error.
    pub async fn output(self) -> Result<Output, ExternalToolError> {
        debug!(command = %self.command_line(), "Running external command");

        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let pending = cmd.output();

        let result = match self.timeout {
            Some(after) => tokio::time::timeout(after, pending).await.map_err(|_| {
                ExternalToolError::TimedOut {
                    program: self.program.clone(),
                    after,
                }
            })?,
            None => pending.await,
        };
        let output = result.map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ExternalToolError::Failed {
                program: self.program,
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(output)
    }

    /// Run to completion, discarding output.
    pub async fn run(self) -> Result<(), ExternalToolError> {
        self.output().await.map(|_| ())
    }

    /// Start a long-running process; it is killed when the handle is dropped.
    pub fn spawn(self) -> Result<Child, ExternalToolError> {
        debug!(command = %self.command_line(), "Spawning external command");
        self.command().spawn().map_err(|e| self.spawn_error(e))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
