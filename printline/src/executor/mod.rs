//! Command execution on the orchestrating host or the worker host.
//!
//! [`RemoteExecutor`] dispatches on [`HostAffinity`]: local commands run as
//! child processes, remote ones go over the dial-out ssh channel. Connection
//! failures, timeouts and non-zero exits stay distinguishable so callers can
//! treat them differently.

mod local;
pub mod shell;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{DialOutCredential, SshExecutor};

use crate::config::WorkerConfig;
use crate::core::HostAffinity;
use crate::errors::PrintlineError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 500;

/// A program and its arguments, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command spec.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last part of stderr, for error messages.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        tail(self.stderr.trim(), STDERR_TAIL).to_string()
    }

    /// Returns the value of the last `KEY=value` line on stdout.
    #[must_use]
    pub fn captured(&self, key: &str) -> Option<String> {
        let prefix = format!("{key}=");
        self.stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix(&prefix).map(ToString::to_string))
    }

    /// Converts a non-zero exit into `ExecError::Failed`.
    pub fn into_success(self, program: &str) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr_tail(),
            })
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Errors from running a command.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started.
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// The program.
        program: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The command exceeded its bound and was terminated.
    #[error("`{program}` exceeded {}s", .after.as_secs())]
    Timeout {
        /// The program.
        program: String,
        /// The bound.
        after: Duration,
    },

    /// The worker could not be reached.
    #[error("cannot reach {host}: {detail}")]
    Connectivity {
        /// The worker host.
        host: String,
        /// Client diagnostics.
        detail: String,
    },

    /// The command exited non-zero.
    #[error("`{program}` exited with {exit_code:?}: {stderr}")]
    Failed {
        /// The program.
        program: String,
        /// Exit code.
        exit_code: Option<i32>,
        /// Trailing stderr.
        stderr: String,
    },

    /// A transfer path that cannot be sent to the worker unambiguously.
    #[error("refusing to transfer '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A remote command was requested but no worker is configured.
    #[error("no worker host configured for remote execution")]
    NoWorker,

    /// IO error while waiting on the process.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for PrintlineError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Spawn { program, source } => Self::CommandFailure {
                program,
                exit_code: None,
                stderr: source.to_string(),
            },
            ExecError::Timeout { program, after } => Self::Timeout {
                operation: program,
                after,
            },
            ExecError::Connectivity { host, detail } => {
                Self::Connectivity(format!("{host}: {detail}"))
            }
            ExecError::Failed {
                program,
                exit_code,
                stderr,
            } => Self::CommandFailure {
                program,
                exit_code,
                stderr,
            },
            err @ ExecError::InvalidPath { .. } => Self::Validation(err.to_string()),
            ExecError::NoWorker => {
                Self::Config("a remote step requires [worker].host".to_string())
            }
            ExecError::Io(e) => Self::Io(e),
        }
    }
}

/// Executes commands with a given host affinity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `spec` on the host selected by `affinity` within `timeout`.
    ///
    /// A non-zero exit is returned as output, not as an error.
    async fn execute(
        &self,
        affinity: HostAffinity,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;

    /// Copies `remote` from the worker to the local path `local`.
    async fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<(), ExecError>;
}

/// Routes commands to the local host or the worker.
#[derive(Debug, Clone, Default)]
pub struct RemoteExecutor {
    local: LocalExecutor,
    remote: Option<SshExecutor>,
}

impl RemoteExecutor {
    /// Creates an executor; remote commands fail when `remote` is `None`.
    #[must_use]
    pub fn new(remote: Option<SshExecutor>) -> Self {
        Self {
            local: LocalExecutor::new(),
            remote,
        }
    }

    /// Builds an executor from the worker section.
    #[must_use]
    pub fn from_config(worker: &WorkerConfig) -> Self {
        Self::new(DialOutCredential::from_config(worker).map(SshExecutor::new))
    }

    /// Whether remote commands can be dispatched.
    #[must_use]
    pub fn has_worker(&self) -> bool {
        self.remote.is_some()
    }

    fn worker(&self) -> Result<&SshExecutor, ExecError> {
        self.remote.as_ref().ok_or(ExecError::NoWorker)
    }
}

#[async_trait]
impl CommandExecutor for RemoteExecutor {
    async fn execute(
        &self,
        affinity: HostAffinity,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        match affinity {
            HostAffinity::Local => self.local.run(spec, timeout).await,
            HostAffinity::Remote => self.worker()?.run(spec, timeout).await,
        }
    }

    async fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<(), ExecError> {
        self.worker()?.pull(remote, local, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_captured_uses_last_matching_line() {
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "starting\nRESULT_PATH=/a\nnoise\n  RESULT_PATH=/b  \n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.captured("RESULT_PATH").as_deref(), Some("/b"));
        assert_eq!(output.captured("MISSING"), None);
    }

    #[test]
    fn test_into_success() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        };
        assert!(ok.into_success("true").is_ok());

        let failed = CommandOutput {
            exit_code: Some(2),
            stderr: "bad".to_string(),
            ..CommandOutput::default()
        };
        let err = PrintlineError::from(failed.into_success("orca-slicer").unwrap_err());
        assert_eq!(err.kind(), ErrorKind::CommandFailure);
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_stderr_tail_respects_char_boundaries() {
        let output = CommandOutput {
            stderr: "é".repeat(400),
            ..CommandOutput::default()
        };
        let tail = output.stderr_tail();
        assert!(tail.len() <= STDERR_TAIL);
        assert!(tail.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_error_kinds() {
        let timeout = PrintlineError::from(ExecError::Timeout {
            program: "docker".to_string(),
            after: Duration::from_secs(600),
        });
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let unreachable = PrintlineError::from(ExecError::Connectivity {
            host: "pi".to_string(),
            detail: "Connection refused".to_string(),
        });
        assert_eq!(unreachable.kind(), ErrorKind::Connectivity);

        assert_eq!(PrintlineError::from(ExecError::NoWorker).kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_remote_without_worker_is_rejected() {
        let executor = RemoteExecutor::default();
        assert!(!executor.has_worker());

        let err = executor
            .execute(
                HostAffinity::Remote,
                &CommandSpec::new("ls", Vec::<String>::new()),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NoWorker));
    }
}
