//! Notification events emitted at run and step transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Something began.
    Start,
    /// Something completed successfully.
    Success,
    /// Something failed.
    Failure,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// A human-readable status event delivered through a notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// The run this event belongs to; absent for watcher-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    /// The step this event belongs to; absent for run-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    /// The kind of event.
    pub kind: EventKind,

    /// The message for a human reader.
    pub message: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl NotifyEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            run_id: None,
            step_name: None,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attaches a run id.
    #[must_use]
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attaches a step name.
    #[must_use]
    pub fn for_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    /// Creates a run-start event.
    #[must_use]
    pub fn run_started(run_id: Uuid, project_name: &str) -> Self {
        Self::new(
            EventKind::Start,
            format!("Pipeline starting for project: {project_name}"),
        )
        .for_run(run_id)
    }

    /// Creates a run-success event.
    #[must_use]
    pub fn run_succeeded(run_id: Uuid, project_name: &str, elapsed_minutes: f64) -> Self {
        Self::new(
            EventKind::Success,
            format!("Pipeline complete for '{project_name}' in {elapsed_minutes:.1} minutes"),
        )
        .for_run(run_id)
    }

    /// Creates a run-failure event.
    #[must_use]
    pub fn run_failed(run_id: Uuid, elapsed_minutes: f64, error: &str) -> Self {
        Self::new(
            EventKind::Failure,
            format!("Pipeline failed after {elapsed_minutes:.1} minutes: {error}"),
        )
        .for_run(run_id)
    }

    /// Creates a run-aborted event.
    #[must_use]
    pub fn run_aborted(run_id: Uuid, elapsed_minutes: f64, reason: &str) -> Self {
        Self::new(
            EventKind::Failure,
            format!("Pipeline aborted after {elapsed_minutes:.1} minutes: {reason}"),
        )
        .for_run(run_id)
    }

    /// Creates a step-start event.
    #[must_use]
    pub fn step_started(run_id: Uuid, step_name: &str) -> Self {
        Self::new(EventKind::Start, format!("Step {step_name} started"))
            .for_run(run_id)
            .for_step(step_name)
    }

    /// Creates a step-success event.
    #[must_use]
    pub fn step_succeeded(run_id: Uuid, step_name: &str, elapsed_secs: f64) -> Self {
        Self::new(
            EventKind::Success,
            format!("Step {step_name} completed in {elapsed_secs:.0}s"),
        )
        .for_run(run_id)
        .for_step(step_name)
    }

    /// Creates a step-failure event.
    #[must_use]
    pub fn step_failed(run_id: Uuid, step_name: &str, elapsed_secs: f64, error: &str) -> Self {
        Self::new(
            EventKind::Failure,
            format!("Step {step_name} failed after {elapsed_secs:.0}s: {error}"),
        )
        .for_run(run_id)
        .for_step(step_name)
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            EventKind::Start => "[start]",
            EventKind::Success => "[ok]",
            EventKind::Failure => "[FAILED]",
        };
        write!(f, "{prefix} printline: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_event() {
        let run_id = Uuid::new_v4();
        let event = NotifyEvent::step_failed(run_id, "decimate", 12.0, "exit code 1");

        assert_eq!(event.kind, EventKind::Failure);
        assert_eq!(event.run_id, Some(run_id));
        assert_eq!(event.step_name.as_deref(), Some("decimate"));
        assert_eq!(event.message, "Step decimate failed after 12s: exit code 1");
    }

    #[test]
    fn test_run_event_has_no_step() {
        let event = NotifyEvent::run_started(Uuid::new_v4(), "owl");
        assert!(event.step_name.is_none());
        assert_eq!(event.kind, EventKind::Start);
    }

    #[test]
    fn test_display_prefix() {
        let event = NotifyEvent::new(EventKind::Failure, "scanner offline");
        assert_eq!(event.to_string(), "[FAILED] printline: scanner offline");
    }

    #[test]
    fn test_event_serialize_skips_absent_ids() {
        let event = NotifyEvent::new(EventKind::Start, "Watcher started");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("run_id").is_none());
        assert_eq!(json["kind"], "start");
    }
}
