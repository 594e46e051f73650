//! Run status, step status and host affinity enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a step executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAffinity {
    /// On the orchestrating host.
    Local,
    /// On the worker host, reached over the dial-out channel.
    Remote,
}

impl Default for HostAffinity {
    fn default() -> Self {
        Self::Local
    }
}

impl fmt::Display for HostAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// The lifecycle status of a pipeline run.
///
/// Transitions only move forward:
/// `Pending -> Running -> {Succeeded | Failed | Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started.
    Pending,
    /// Steps are executing.
    Running,
    /// Every step succeeded or was skipped.
    Succeeded,
    /// Stopped at the first failed step.
    Failed,
    /// Stopped at a step boundary by an external abort.
    Aborted,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Returns true if moving from `self` to `next` is a forward transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Aborted),
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Aborted => false,
        }
    }
}

/// The execution status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not reached yet.
    NotStarted,
    /// Currently executing (possibly on a retry).
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed after exhausting its attempts.
    Failed,
    /// Disabled for this run.
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true if the next step may begin after this one.
    #[must_use]
    pub fn allows_successor(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_forward_only() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Aborted));

        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::NotStarted.is_terminal());

        assert!(!StepStatus::Failed.allows_successor());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);

        let json = serde_json::to_string(&StepStatus::NotStarted).unwrap();
        assert_eq!(json, r#""not_started""#);

        let affinity: HostAffinity = serde_json::from_str(r#""remote""#).unwrap();
        assert_eq!(affinity, HostAffinity::Remote);
    }
}
