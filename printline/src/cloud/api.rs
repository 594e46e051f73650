//! Photogrammetry service interface.

use super::job::JobStatus;
use crate::errors::PrintlineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the photogrammetry service.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Http {
        /// The endpoint called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The service or its limits refused the submission.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The response could not be interpreted.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Packing or unpacking an archive failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Local file IO failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Whether an immediate retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for CloudError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<CloudError> for PrintlineError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Transport(msg) => Self::Connectivity(format!("cloud service: {msg}")),
            CloudError::Io(e) => Self::Io(e),
            other => Self::RemoteJob(other.to_string()),
        }
    }
}

/// Images to submit for reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Human label, usually the project name.
    pub label: String,
    /// Directory holding the images.
    pub images: PathBuf,
    /// Directory for temporary archives and the downloaded result.
    pub work_dir: PathBuf,
}

/// A remote photogrammetry service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotogrammetryApi: Send + Sync {
    /// Uploads the images and starts processing. Returns the job id.
    async fn submit(&self, submission: &Submission) -> Result<String, CloudError>;

    /// Reports the job's current state.
    async fn status(&self, job_id: &str) -> Result<JobStatus, CloudError>;

    /// Downloads the finished result into `dest_dir` and returns the mesh path.
    async fn download(&self, job_id: &str, dest_dir: &Path) -> Result<PathBuf, CloudError>;
}
