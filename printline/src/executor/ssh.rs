//! Dial-out channel to the worker host.
//!
//! Connections are always opened from the orchestrating host with a key it
//! holds. Nothing here listens or accepts connections, so the worker has no
//! way to reach back.

use super::local::run_child;
use super::shell::quote_command;
use super::{CommandOutput, CommandSpec, ExecError};
use crate::config::WorkerConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status ssh reports when it could not establish the session.
const SSH_CONNECTION_EXIT: i32 = 255;

/// Exit status of coreutils `timeout` when the bound elapsed.
const REMOTE_TIMEOUT_EXIT: i32 = 124;

/// Characters that the SFTP and legacy scp protocols treat differently in a
/// remote path: glob patterns, shell syntax and whitespace.
const TRANSFER_UNSAFE: &[char] = &[
    '*', '?', '[', ']', '{', '}', '\'', '"', '\\', '$', '`', ';', '&', '|', '<', '>', '(', ')', '~', '!',
];

/// Extra local allowance over the remote bound before the ssh client is
/// killed.
const LOCAL_GRACE: Duration = Duration::from_secs(5);

const CONNECTION_PATTERNS: [&str; 8] = [
    "connection refused",
    "connection reset",
    "connection timed out",
    "no route to host",
    "network is unreachable",
    "could not resolve hostname",
    "temporary failure in name resolution",
    "connection closed by remote host",
];

/// The orchestrator's credential for reaching the worker.
///
/// Only built from the orchestrator's own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOutCredential {
    user: String,
    host: String,
    port: u16,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl DialOutCredential {
    /// Returns a credential if a worker host is configured.
    #[must_use]
    pub fn from_config(worker: &WorkerConfig) -> Option<Self> {
        let host = worker.host.as_ref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(Self {
            user: worker.user.clone(),
            host: host.to_string(),
            port: worker.port,
            identity_file: worker.identity_file.clone(),
            connect_timeout: Duration::from_secs(worker.connect_timeout_secs.max(1)),
        })
    }

    /// The worker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by ssh and scp. `port_flag` differs between the two.
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ];
        if self.port != 22 {
            args.push(port_flag.to_string());
            args.push(self.port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }
}

/// Runs commands on the worker over ssh.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    credential: DialOutCredential,
}

impl SshExecutor {
    /// Creates an executor for the given credential.
    #[must_use]
    pub fn new(credential: DialOutCredential) -> Self {
        Self { credential }
    }

    /// The credential in use.
    #[must_use]
    pub fn credential(&self) -> &DialOutCredential {
        &self.credential
    }

    /// Builds the ssh argv for a remote command bounded by `timeout`.
    #[must_use]
    pub fn ssh_args(&self, spec: &CommandSpec, timeout: Duration) -> Vec<String> {
        let remote = format!(
            "timeout {} {}",
            timeout.as_secs().max(1),
            quote_command(&spec.program, &spec.args)
        );
        let mut args = self.credential.common_args("-p");
        args.push(self.credential.destination());
        args.push(remote);
        args
    }

    /// Builds the scp argv that copies `remote` from the worker to `local`.
    ///
    /// The remote path is passed as is: scp in SFTP mode (the OpenSSH
    /// default since 9.0) takes quotes literally. Paths whose meaning would
    /// differ between SFTP and the legacy protocol are refused.
    pub fn scp_args(&self, remote: &str, local: &Path) -> Result<Vec<String>, ExecError> {
        check_transfer_path(remote)?;
        let mut args = self.credential.common_args("-P");
        args.push("-r".to_string());
        args.push("-q".to_string());
        args.push(format!("{}:{remote}", self.credential.destination()));
        args.push(local.display().to_string());
        Ok(args)
    }

    /// Runs `spec` on the worker. The remote process is terminated by
    /// `timeout` on the worker and the local client is killed shortly after.
    pub async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new("ssh");
        command
            .args(self.ssh_args(spec, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %self.credential.host, program = %spec.program, "dispatching remote command");
        let local_bound = timeout + self.credential.connect_timeout + LOCAL_GRACE;
        let output = match run_child(command, "ssh", local_bound).await {
            Err(ExecError::Timeout { .. }) => {
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    after: timeout,
                })
            }
            other => other?,
        };

        match output.exit_code {
            Some(SSH_CONNECTION_EXIT) => Err(ExecError::Connectivity {
                host: self.credential.host.clone(),
                detail: output.stderr_tail(),
            }),
            Some(REMOTE_TIMEOUT_EXIT) => Err(ExecError::Timeout {
                program: spec.program.clone(),
                after: timeout,
            }),
            _ => Ok(output),
        }
    }

    /// Copies `remote` (file or directory) from the worker to `local`.
    pub async fn pull(&self, remote: &str, local: &Path, timeout: Duration) -> Result<(), ExecError> {
        check_transfer_path(remote)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args = self.scp_args(remote, local)?;
        let mut command = Command::new("scp");
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(host = %self.credential.host, remote, local = %local.display(), "pulling from worker");
        let output = run_child(command, "scp", timeout).await?;
        if output.success() {
            return Ok(());
        }
        if is_connection_failure(&output) {
            return Err(ExecError::Connectivity {
                host: self.credential.host.clone(),
                detail: output.stderr_tail(),
            });
        }
        Err(ExecError::Failed {
            program: "scp".to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr_tail(),
        })
    }
}

fn check_transfer_path(remote: &str) -> Result<(), ExecError> {
    if remote.is_empty() {
        return Err(ExecError::InvalidPath {
            path: remote.to_string(),
            reason: "empty".to_string(),
        });
    }
    match remote
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || TRANSFER_UNSAFE.contains(c))
    {
        Some(c) => Err(ExecError::InvalidPath {
            path: remote.to_string(),
            reason: format!("contains {c:?}"),
        }),
        None => Ok(()),
    }
}

fn is_connection_failure(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    output.exit_code == Some(SSH_CONNECTION_EXIT)
        || CONNECTION_PATTERNS.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn worker() -> WorkerConfig {
        WorkerConfig {
            host: Some("192.168.1.134".to_string()),
            user: "sanchobot".to_string(),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_no_credential_without_host() {
        assert!(DialOutCredential::from_config(&WorkerConfig::default()).is_none());

        let blank = WorkerConfig {
            host: Some("  ".to_string()),
            ..WorkerConfig::default()
        };
        assert!(DialOutCredential::from_config(&blank).is_none());
    }

    #[test]
    fn test_ssh_args_wrap_remote_timeout() {
        let executor = SshExecutor::new(DialOutCredential::from_config(&worker()).unwrap());
        let spec = CommandSpec::new("ls", ["/mnt/scan data"]);
        let args = executor.ssh_args(&spec, Duration::from_secs(60));

        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "ServerAliveInterval=15",
                "-o",
                "ServerAliveCountMax=3",
                "sanchobot@192.168.1.134",
                "timeout 60 'ls' '/mnt/scan data'",
            ]
        );
    }

    #[test]
    fn test_port_and_identity() {
        let config = WorkerConfig {
            port: 2222,
            identity_file: Some(PathBuf::from("/home/me/.ssh/worker")),
            ..worker()
        };
        let executor = SshExecutor::new(DialOutCredential::from_config(&config).unwrap());

        let ssh = executor.ssh_args(&CommandSpec::new("true", Vec::<String>::new()), Duration::from_secs(1));
        assert!(ssh.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(ssh.windows(2).any(|w| w[0] == "-i" && w[1] == "/home/me/.ssh/worker"));

        let scp = executor
            .scp_args("/mnt/scandata/scans/owl", Path::new("/tmp/owl"))
            .unwrap();
        assert!(scp.windows(2).any(|w| w[0] == "-P" && w[1] == "2222"));
        assert_eq!(
            scp.last().map(String::as_str),
            Some("/tmp/owl")
        );
    }

    #[test]
    fn test_scp_args_pass_remote_path_unquoted() {
        let executor = SshExecutor::new(DialOutCredential::from_config(&worker()).unwrap());
        let scp = executor
            .scp_args("/mnt/scandata/scans/owl_2024-05-01", Path::new("/srv/scans/owl"))
            .unwrap();

        assert_eq!(
            scp,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "ServerAliveInterval=15",
                "-o",
                "ServerAliveCountMax=3",
                "-r",
                "-q",
                "sanchobot@192.168.1.134:/mnt/scandata/scans/owl_2024-05-01",
                "/srv/scans/owl",
            ]
        );
    }

    #[test]
    fn test_scp_refuses_ambiguous_remote_paths() {
        let executor = SshExecutor::new(DialOutCredential::from_config(&worker()).unwrap());
        for path in ["/mnt/scans/*", "/mnt/scan data", "/mnt/'owl'", "/mnt/$HOME", ""] {
            let err = executor.scp_args(path, Path::new("/tmp/x")).unwrap_err();
            assert!(matches!(err, ExecError::InvalidPath { .. }), "{path:?}");
        }
    }

    #[tokio::test]
    async fn test_pull_refuses_before_spawning() {
        let executor = SshExecutor::new(DialOutCredential::from_config(&worker()).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let err = executor
            .pull("/mnt/scans/owl;rm", &dir.path().join("owl"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidPath { .. }));
        assert!(!dir.path().join("owl").exists());
    }

    #[test]
    fn test_connection_failure_detection() {
        let refused = CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "ssh: connect to host 10.0.0.2 port 22: Connection refused".to_string(),
        };
        assert!(is_connection_failure(&refused));

        let missing = CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "scp: /nope: No such file or directory".to_string(),
        };
        assert!(!is_connection_failure(&missing));
    }
}
