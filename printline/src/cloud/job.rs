//! Cloud job tracking record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a remote photogrammetry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudJobState {
    /// Accepted by the service, not yet observed processing.
    Submitted,
    /// The service reports work in progress.
    Processing,
    /// Finished; the result can be downloaded.
    Complete,
    /// The service reported a failure.
    Failed,
    /// The maximum wait elapsed first.
    TimedOut,
}

impl CloudJobState {
    /// Whether polling should stop.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for CloudJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// What one status poll reported.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    /// Mapped state: `Processing`, `Complete` or `Failed`.
    pub state: CloudJobState,
    /// Progress reported by the service, if any.
    pub progress: Option<f64>,
    /// Raw status text or failure detail.
    pub detail: String,
}

impl JobStatus {
    /// A processing status.
    #[must_use]
    pub fn processing(detail: impl Into<String>) -> Self {
        Self {
            state: CloudJobState::Processing,
            progress: None,
            detail: detail.into(),
        }
    }

    /// A completed status.
    #[must_use]
    pub fn complete() -> Self {
        Self {
            state: CloudJobState::Complete,
            progress: Some(1.0),
            detail: "done".to_string(),
        }
    }

    /// A failed status.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            state: CloudJobState::Failed,
            progress: None,
            detail: detail.into(),
        }
    }
}

/// One submission to the photogrammetry service, owned by the poller for a
/// single step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudJob {
    /// Identifier assigned by the service.
    pub job_id: String,
    /// Last known state.
    pub state: CloudJobState,
    /// Status polls made so far.
    pub poll_count: u32,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the last poll completed.
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl CloudJob {
    /// Records a fresh submission.
    #[must_use]
    pub fn submitted(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: CloudJobState::Submitted,
            poll_count: 0,
            submitted_at: Utc::now(),
            last_polled_at: None,
        }
    }

    /// Records the outcome of a poll.
    pub fn record_poll(&mut self, state: CloudJobState) {
        self.poll_count += 1;
        self.last_polled_at = Some(Utc::now());
        self.state = state;
    }
}
