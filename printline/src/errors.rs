//! Error types for the printline orchestrator.
//!
//! Every failure the pipeline can surface is classified into an [`ErrorKind`]
//! so that run records carry a structured, serializable error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for printline operations.
#[derive(Debug, Error)]
pub enum PrintlineError {
    /// The worker host, scanner share or cloud service could not be reached.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// An external tool exited with a non-zero status.
    #[error("Command `{program}` failed ({}): {stderr}", describe_exit(.exit_code))]
    CommandFailure {
        /// The program that was run.
        program: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Trailing stderr output of the process.
        stderr: String,
    },

    /// A step or poll exceeded its time bound.
    #[error("Timed out after {}s: {operation}", .after.as_secs())]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The cloud service reported a failed job.
    #[error("Remote job failed: {0}")]
    RemoteJob(String),

    /// A run is already active for this project.
    #[error("Run already active for project '{project_name}' (run {active_run_id})")]
    Concurrency {
        /// The contended project.
        project_name: String,
        /// The run currently holding the project.
        active_run_id: Uuid,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A step registry or template failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A run or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A step failed terminally; wraps the underlying error with step context.
    #[error("Step '{step_name}' failed: {source}")]
    StepFailed {
        /// The failing step.
        step_name: String,
        /// The underlying error.
        source: Box<PrintlineError>,
    },

    /// The run was aborted externally.
    #[error("Run aborted: {0}")]
    Aborted(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl PrintlineError {
    /// Wraps an error with the name of the step that produced it.
    #[must_use]
    pub fn in_step(self, step_name: impl Into<String>) -> Self {
        match self {
            already @ Self::StepFailed { .. } => already,
            other => Self::StepFailed {
                step_name: step_name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::CommandFailure { .. } => ErrorKind::CommandFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RemoteJob(_) => ErrorKind::RemoteJob,
            Self::Concurrency { .. } => ErrorKind::Concurrency,
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StepFailed { source, .. } => source.kind(),
            Self::Aborted(_) => ErrorKind::Aborted,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns the step name if this error carries step context.
    #[must_use]
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step_name, .. } => Some(step_name),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PrintlineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PrintlineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Classification of errors, recorded on runs and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worker, scanner or cloud unreachable.
    Connectivity,
    /// External tool exited non-zero.
    CommandFailure,
    /// Step or poll exceeded its bound.
    Timeout,
    /// Cloud service reported failure.
    RemoteJob,
    /// Duplicate active run for a project.
    Concurrency,
    /// Bad configuration.
    Config,
    /// Registry or template validation failure.
    Validation,
    /// Missing run or resource.
    NotFound,
    /// Run aborted between steps.
    Aborted,
    /// Anything else (IO, serialization).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connectivity => "connectivity",
            Self::CommandFailure => "command_failure",
            Self::Timeout => "timeout",
            Self::RemoteJob => "remote_job",
            Self::Concurrency => "concurrency",
            Self::Config => "config",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error recorded on a run or step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Error classification.
    pub kind: ErrorKind,
    /// The step that failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl RunError {
    /// Creates a new run error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step_name: None,
            message: message.into(),
        }
    }

    /// Sets the step name.
    #[must_use]
    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }
}

impl From<&PrintlineError> for RunError {
    fn from(err: &PrintlineError) -> Self {
        match err {
            PrintlineError::StepFailed { step_name, source } => Self {
                kind: source.kind(),
                step_name: Some(step_name.clone()),
                message: source.to_string(),
            },
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_name {
            Some(step) => write!(f, "[{}] {}: {}", self.kind, step, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
