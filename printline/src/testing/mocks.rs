//! Hand-written fakes for the orchestrator's collaborators.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{EventKind, NotifyEvent, OutputRefs};
use crate::errors::PrintlineError;
use crate::notify::{Notifier, NotifyError};
use crate::orchestrator::StepExecutor;
use crate::steps::{StepDefinition, TemplateVars};
use crate::watcher::{RunTrigger, ScanFolder, ScanShare};

type ErrorFactory = Arc<dyn Fn() -> PrintlineError + Send + Sync>;

#[derive(Clone, Default)]
struct Script {
    outputs: OutputRefs,
    delay: Option<Duration>,
    error: Option<ErrorFactory>,
    /// Failures left before the step starts succeeding; `None` fails forever.
    failures_left: Option<u32>,
}

/// A step executor that follows a per-step script and records every call.
///
/// Unscripted steps succeed immediately with no outputs.
#[derive(Default)]
pub struct ScriptedStepExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(String, TemplateVars)>>,
}

impl std::fmt::Debug for ScriptedStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedStepExecutor")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedStepExecutor {
    /// Creates an executor where every step succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `step` produce the given outputs.
    pub fn produce<I, K, V>(&self, step: &str, outputs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.scripts.lock().entry(step.to_string()).or_default().outputs = outputs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
    }

    /// Makes every attempt of `step` fail.
    pub fn fail(&self, step: &str, error: impl Fn() -> PrintlineError + Send + Sync + 'static) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(step.to_string()).or_default();
        script.error = Some(Arc::new(error));
        script.failures_left = None;
    }

    /// Makes the first `times` attempts of `step` fail.
    pub fn fail_times(
        &self,
        step: &str,
        times: u32,
        error: impl Fn() -> PrintlineError + Send + Sync + 'static,
    ) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(step.to_string()).or_default();
        script.error = Some(Arc::new(error));
        script.failures_left = Some(times);
    }

    /// Makes each attempt of `step` take `delay`.
    pub fn delay(&self, step: &str, delay: Duration) {
        self.scripts.lock().entry(step.to_string()).or_default().delay = Some(delay);
    }

    /// Names of the steps executed, one entry per attempt.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// The variables the last attempt of `step` received.
    #[must_use]
    pub fn vars_for(&self, step: &str) -> Option<TemplateVars> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| name == step)
            .map(|(_, vars)| vars.clone())
    }
}

#[async_trait]
impl StepExecutor for ScriptedStepExecutor {
    async fn execute(&self, step: &StepDefinition, vars: &TemplateVars) -> Result<OutputRefs, PrintlineError> {
        self.calls.lock().push((step.name.clone(), vars.clone()));
        let script = self.scripts.lock().get(&step.name).cloned().unwrap_or_default();

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = &script.error {
            let mut scripts = self.scripts.lock();
            let failing = match scripts.get_mut(&step.name).and_then(|s| s.failures_left.as_mut()) {
                Some(0) => false,
                Some(left) => {
                    *left -= 1;
                    true
                }
                None => true,
            };
            if failing {
                return Err(error());
            }
        }
        Ok(script.outputs)
    }
}

/// Records every notification.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: RwLock<Vec<NotifyEvent>>,
}

impl CollectingNotifier {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<NotifyEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Counts events of one kind.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.read().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Listing {
    Folders(Vec<String>),
    Unreachable,
}

/// A scan share that answers from a script of listings.
///
/// Each call consumes one listing; the last one repeats once the script runs
/// out. An empty script lists nothing.
#[derive(Debug, Default)]
pub struct StaticScanShare {
    script: Mutex<VecDeque<Listing>>,
    last: Mutex<Option<Listing>>,
    calls: Mutex<usize>,
}

impl StaticScanShare {
    /// Creates a share with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listing of the given folder names.
    #[must_use]
    pub fn with_folders<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .lock()
            .push_back(Listing::Folders(names.into_iter().map(Into::into).collect()));
        self
    }

    /// Appends a listing that fails as unreachable.
    #[must_use]
    pub fn with_unreachable(self) -> Self {
        self.script.lock().push_back(Listing::Unreachable);
        self
    }

    /// Number of listings served.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl ScanShare for StaticScanShare {
    async fn list_folders(&self) -> Result<Vec<ScanFolder>, PrintlineError> {
        *self.calls.lock() += 1;
        let next = self.script.lock().pop_front();
        let listing = {
            let mut last = self.last.lock();
            if let Some(next) = next {
                *last = Some(next);
            }
            last.clone()
        };

        match listing {
            None => Ok(Vec::new()),
            Some(Listing::Unreachable) => Err(PrintlineError::Connectivity(
                "scanner share unreachable".to_string(),
            )),
            Some(Listing::Folders(names)) => Ok(names
                .into_iter()
                .map(|name| ScanFolder::new(name, 1))
                .collect()),
        }
    }
}

/// A run trigger that records requests instead of starting runs.
#[derive(Default)]
pub struct RecordingTrigger {
    triggered: Mutex<Vec<String>>,
    attempts: Mutex<usize>,
    failures: Mutex<HashMap<String, ErrorFactory>>,
}

impl std::fmt::Debug for RecordingTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTrigger")
            .field("triggered", &self.triggered.lock())
            .finish_non_exhaustive()
    }
}

impl RecordingTrigger {
    /// Creates a trigger that accepts every project.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes triggers for `project` fail.
    pub fn fail_with(&self, project: &str, error: impl Fn() -> PrintlineError + Send + Sync + 'static) {
        self.failures
            .lock()
            .insert(project.to_string(), Arc::new(error));
    }

    /// Projects successfully triggered, in order.
    #[must_use]
    pub fn triggered(&self) -> Vec<String> {
        self.triggered.lock().clone()
    }

    /// Number of trigger calls, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl RunTrigger for RecordingTrigger {
    async fn trigger(&self, project_name: &str) -> Result<Uuid, PrintlineError> {
        *self.attempts.lock() += 1;
        if let Some(error) = self.failures.lock().get(project_name) {
            return Err(error());
        }
        self.triggered.lock().push(project_name.to_string());
        Ok(Uuid::new_v4())
    }
}
