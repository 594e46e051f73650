//! Pipeline run and step result records.

use super::{RunStatus, StepStatus};
use crate::errors::{PrintlineError, RunError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Mapping from output name to artifact location.
pub type OutputRefs = BTreeMap<String, String>;

/// Runtime record of one step's execution within a run.
///
/// Created when the orchestrator reaches the step and immutable once its
/// status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step this result belongs to.
    pub step_name: String,
    /// Number of attempts made so far.
    pub attempt_count: u32,
    /// Current status.
    pub status: StepStatus,
    /// Artifacts produced, keyed by output name.
    #[serde(default)]
    pub output_refs: OutputRefs,
    /// Terminal error, if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// When the first attempt began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// Creates a result for a step that has not started.
    #[must_use]
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            attempt_count: 0,
            status: StepStatus::NotStarted,
            output_refs: OutputRefs::new(),
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn ensure_mutable(&self) -> Result<(), PrintlineError> {
        if self.status.is_terminal() {
            return Err(PrintlineError::Validation(format!(
                "step result for '{}' is already {}",
                self.step_name, self.status
            )));
        }
        Ok(())
    }

    /// Marks the step as running.
    pub fn start(&mut self) -> Result<(), PrintlineError> {
        self.ensure_mutable()?;
        self.status = StepStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Records the beginning of another attempt and returns its number.
    pub fn begin_attempt(&mut self) -> Result<u32, PrintlineError> {
        self.ensure_mutable()?;
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// Marks the step as succeeded with the produced outputs.
    pub fn succeed(&mut self, outputs: OutputRefs) -> Result<(), PrintlineError> {
        self.ensure_mutable()?;
        self.status = StepStatus::Succeeded;
        self.output_refs = outputs;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the step as terminally failed.
    pub fn fail(&mut self, error: RunError) -> Result<(), PrintlineError> {
        self.ensure_mutable()?;
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the step as skipped.
    pub fn skip(&mut self) -> Result<(), PrintlineError> {
        self.ensure_mutable()?;
        self.status = StepStatus::Skipped;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

/// One end-to-end execution of the step sequence for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique token generated at start.
    pub run_id: Uuid,
    /// The scan project being processed.
    pub project_name: String,
    /// Results for every step reached so far, in registry order.
    #[serde(default)]
    pub steps: Vec<StepResult>,
    /// Index of the step most recently reached.
    pub current_step_index: usize,
    /// Run lifecycle status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run entered `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// The error that stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
}

impl PipelineRun {
    /// Creates a pending run with a fresh run id.
    #[must_use]
    pub fn new(project_name: impl Into<String>) -> Self {
        Self::with_run_id(Uuid::new_v4(), project_name)
    }

    /// Creates a pending run with a specific run id.
    #[must_use]
    pub fn with_run_id(run_id: Uuid, project_name: impl Into<String>) -> Self {
        Self {
            run_id,
            project_name: project_name.into(),
            steps: Vec::new(),
            current_step_index: 0,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_error: None,
        }
    }

    /// Moves the run to `next`, rejecting backward transitions.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), PrintlineError> {
        if !self.status.can_transition_to(next) {
            return Err(PrintlineError::Validation(format!(
                "run {} cannot move from {} to {}",
                self.run_id, self.status, next
            )));
        }
        self.status = next;
        if next == RunStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records the terminal error and moves the run to `Failed`.
    pub fn fail(&mut self, error: RunError) -> Result<(), PrintlineError> {
        self.transition(RunStatus::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Appends a result for the next step and makes it current.
    pub fn push_step(&mut self, step_name: impl Into<String>) -> &mut StepResult {
        self.current_step_index = self.steps.len();
        self.steps.push(StepResult::new(step_name));
        let index = self.current_step_index;
        &mut self.steps[index]
    }

    /// Returns the current step result, if any step was reached.
    #[must_use]
    pub fn current_step(&self) -> Option<&StepResult> {
        self.steps.get(self.current_step_index)
    }

    /// Returns a mutable reference to the current step result.
    pub fn current_step_mut(&mut self) -> Option<&mut StepResult> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Looks up a step result by name.
    #[must_use]
    pub fn step(&self, step_name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == step_name)
    }

    /// Merges the outputs of every succeeded step.
    #[must_use]
    pub fn outputs(&self) -> OutputRefs {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .flat_map(|s| s.output_refs.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Returns the wall-clock duration of the run, if it has started.
    #[must_use]
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_run_is_pending() {
        let run = PipelineRun::new("owl");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.steps.is_empty());
        assert!(run.started_at.is_none());
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut run = PipelineRun::new("owl");
        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        assert!(run.ended_at.is_none());

        run.transition(RunStatus::Succeeded).unwrap();
        assert!(run.ended_at.is_some());
        assert!(run.elapsed().is_some());
    }

    #[test]
    fn test_transition_rejects_backward() {
        let mut run = PipelineRun::new("owl");
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();

        assert!(run.transition(RunStatus::Running).is_err());
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn test_step_result_immutable_once_terminal() {
        let mut step = StepResult::new("slice");
        step.start().unwrap();
        assert_eq!(step.begin_attempt().unwrap(), 1);
        step.succeed(OutputRefs::from([("package".to_string(), "/m/owl.3mf".to_string())]))
            .unwrap();

        assert!(step.begin_attempt().is_err());
        assert!(step.fail(RunError::new(ErrorKind::Internal, "late")).is_err());
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.attempt_count, 1);
    }

    #[test]
    fn test_push_step_tracks_index() {
        let mut run = PipelineRun::new("owl");
        run.push_step("fetch_scan");
        run.push_step("pull_images");

        assert_eq!(run.current_step_index, 1);
        assert_eq!(run.current_step().unwrap().step_name, "pull_images");
    }

    #[test]
    fn test_outputs_only_from_succeeded_steps() {
        let mut run = PipelineRun::new("owl");
        let step = run.push_step("a");
        step.start().unwrap();
        step.succeed(OutputRefs::from([("x".to_string(), "1".to_string())]))
            .unwrap();
        let step = run.push_step("b");
        step.start().unwrap();
        step.fail(RunError::new(ErrorKind::CommandFailure, "boom"))
            .unwrap();

        let outputs = run.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get("x").map(String::as_str), Some("1"));
    }
}
