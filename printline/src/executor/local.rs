//! Commands on the orchestrating host.

use super::{CommandOutput, CommandSpec, ExecError};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Runs commands as child processes of the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Creates a local executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs `spec` to completion, killing the child if `timeout` elapses.
    pub async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_child(command, &spec.program, timeout).await
    }
}

/// Spawns a prepared command and collects its output within `timeout`.
pub(super) async fn run_child(
    mut command: Command,
    program: &str,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let started = Instant::now();
    let child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ExecError::Timeout {
                program: program.to_string(),
                after: timeout,
            })
        }
    };

    let output = CommandOutput::from(output);
    debug!(
        program,
        exit_code = ?output.exit_code,
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "command finished"
    );
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh", ["-c", "echo RESULT_PATH=/tmp/x; echo oops >&2; exit 3"]);
        let output = LocalExecutor::new()
            .run(&spec, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "RESULT_PATH=/tmp/x");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let spec = CommandSpec::new("sleep", ["5"]);
        let err = LocalExecutor::new()
            .run(&spec, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec::new("printline-no-such-binary", Vec::<String>::new());
        let err = LocalExecutor::new()
            .run(&spec, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
