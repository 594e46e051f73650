//! The run state machine.
//!
//! One generic loop walks the [`StepRegistry`] in order. Each step runs to a
//! terminal result (with retries) before the next begins, and the first
//! terminal failure stops the run.
//!
//! [`Orchestrator::abort`] stops one run at its next step boundary.
//! [`Orchestrator::shutdown`] stops every run, interrupting steps in flight,
//! and waits until each record is terminal.

use super::active::{ActiveRunGuard, ActiveRuns};
use super::dispatch::StepExecutor;
use super::store::{InMemoryRunStore, RunStore};
use crate::cancellation::CancellationToken;
use crate::core::{NotifyEvent, OutputRefs, PipelineRun, RunStatus};
use crate::errors::{ErrorKind, PrintlineError, RunError};
use crate::notify::{deliver, LoggingNotifier, Notifier};
use crate::steps::{StepDefinition, StepRegistry, TemplateVars};
use crate::watcher::{ProjectResolver, RunTrigger};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    project_name: String,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    /// The run's id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The project being processed.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Waits for the run to reach a terminal status.
    pub async fn wait(self) -> Result<PipelineRun, PrintlineError> {
        self.task
            .await
            .map_err(|e| PrintlineError::Aborted(format!("run {} task ended abnormally: {e}", self.run_id)))
    }
}

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: StepRegistry,
    executor: Arc<dyn StepExecutor>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn RunStore>,
    resolver: Option<Arc<dyn ProjectResolver>>,
    lock_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    /// Sets the notifier. Defaults to [`LoggingNotifier`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the run store. Defaults to [`InMemoryRunStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets how runs without a project name find one.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn ProjectResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Also guards projects with lock files in `lock_dir`, so orchestrators
    /// in other processes sharing the directory see each other's runs.
    #[must_use]
    pub fn lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(lock_dir.into());
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let active = self
            .lock_dir
            .map_or_else(ActiveRuns::new, ActiveRuns::with_lock_dir);
        let (in_flight, _) = watch::channel(0);
        Orchestrator {
            inner: Arc::new(Inner {
                registry: self.registry,
                executor: self.executor,
                notifier: self.notifier,
                store: self.store,
                resolver: self.resolver,
                active,
                cancellations: DashMap::new(),
                halt: CancellationToken::new(),
                in_flight: Arc::new(in_flight),
            }),
        }
    }
}

/// Runs the step sequence for projects, one run per project at a time.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: StepRegistry,
    executor: Arc<dyn StepExecutor>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn RunStore>,
    resolver: Option<Arc<dyn ProjectResolver>>,
    active: ActiveRuns,
    cancellations: DashMap<Uuid, Arc<CancellationToken>>,
    halt: CancellationToken,
    in_flight: Arc<watch::Sender<usize>>,
}

/// Counts a run as in flight until dropped.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.inner.registry.len())
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator over `registry`.
    #[must_use]
    pub fn builder(registry: StepRegistry, executor: Arc<dyn StepExecutor>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            executor,
            notifier: Arc::new(LoggingNotifier),
            store: Arc::new(InMemoryRunStore::new()),
            resolver: None,
            lock_dir: None,
        }
    }

    /// The step sequence.
    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.inner.registry
    }

    /// The active run registry.
    #[must_use]
    pub fn active_runs(&self) -> &ActiveRuns {
        &self.inner.active
    }

    /// Starts a run in the background.
    ///
    /// Without a project name the most recent scan is used.
    ///
    /// # Errors
    ///
    /// Returns `PrintlineError::Concurrency` if the project already has an
    /// active run, `NotFound` if no project can be resolved, or `Aborted`
    /// once [`Orchestrator::shutdown`] has been called.
    pub async fn start_run(&self, project_name: Option<String>) -> Result<RunHandle, PrintlineError> {
        // Counted before the shutdown check so shutdown waits for this run.
        let in_flight = InFlight::enter(&self.inner.in_flight);
        if let Some(reason) = self.inner.halt.reason() {
            return Err(PrintlineError::Aborted(format!(
                "orchestrator is shutting down: {reason}"
            )));
        }
        let project_name = self.inner.resolve_project(project_name).await?;
        let run = PipelineRun::new(&project_name);
        let guard = self.inner.active.claim(&project_name, run.run_id)?;

        let token = Arc::new(CancellationToken::new());
        self.inner.cancellations.insert(run.run_id, Arc::clone(&token));
        self.inner.persist(&run).await;
        info!(run_id = %run.run_id, project = %project_name, "run created");

        let run_id = run.run_id;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let run = inner.execute_run(run, guard, &token).await;
            drop(in_flight);
            run
        });

        Ok(RunHandle {
            run_id,
            project_name,
            task,
        })
    }

    /// Starts a run and waits for it to finish.
    pub async fn run(&self, project_name: Option<String>) -> Result<PipelineRun, PrintlineError> {
        self.start_run(project_name).await?.wait().await
    }

    /// Returns the latest record of a run.
    pub async fn get_status(&self, run_id: Uuid) -> Result<PipelineRun, PrintlineError> {
        self.inner
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| PrintlineError::NotFound(format!("run {run_id}")))
    }

    /// Requests that a run stop at the next step boundary.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the run already finished and `NotFound` if it
    /// never existed.
    pub async fn abort(&self, run_id: Uuid, reason: impl Into<String>) -> Result<(), PrintlineError> {
        if let Some(token) = self.inner.cancellations.get(&run_id) {
            token.cancel(reason);
            info!(run_id = %run_id, "abort requested");
            return Ok(());
        }
        let run = self.get_status(run_id).await?;
        Err(PrintlineError::Validation(format!(
            "run {run_id} already {}",
            run.status
        )))
    }

    /// Stops every run and waits until each one has persisted a terminal
    /// record. Steps in flight are interrupted and recorded as failed, the
    /// runs end `Aborted`, and later `start_run` calls are refused.
    ///
    /// Returns the number of runs that were still in flight.
    pub async fn shutdown(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        self.inner.halt.cancel(reason.clone());
        for token in self.inner.cancellations.iter() {
            token.cancel(reason.clone());
        }

        let mut in_flight = self.inner.in_flight.subscribe();
        let pending = *in_flight.borrow();
        info!(pending, reason = %reason, "shutting down");
        // The sender lives in `inner`, so this only returns once drained.
        let _ = in_flight.wait_for(|n| *n == 0).await;
        pending
    }

    /// Lists stored runs, oldest first.
    pub async fn list_runs(&self) -> Result<Vec<PipelineRun>, PrintlineError> {
        self.inner.store.list().await
    }
}

#[async_trait]
impl RunTrigger for Orchestrator {
    async fn trigger(&self, project_name: &str) -> Result<Uuid, PrintlineError> {
        self.start_run(Some(project_name.to_string()))
            .await
            .map(|handle| handle.run_id())
    }
}

fn minutes(run: &PipelineRun) -> f64 {
    run.elapsed()
        .and_then(|d| d.to_std().ok())
        .map_or(0.0, |d| d.as_secs_f64() / 60.0)
}

fn retry_allowed(err: &PrintlineError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::Validation | ErrorKind::Config | ErrorKind::Aborted
    )
}

impl Inner {
    async fn resolve_project(&self, project_name: Option<String>) -> Result<String, PrintlineError> {
        if let Some(name) = project_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(PrintlineError::Validation(
                    "project name must not be empty".to_string(),
                ));
            }
            return Ok(name.to_string());
        }

        let resolver = self.resolver.as_ref().ok_or_else(|| {
            PrintlineError::Config("no project given and no scan share configured".to_string())
        })?;
        let latest = resolver
            .latest_project()
            .await?
            .ok_or_else(|| PrintlineError::NotFound("no scans on the scanner share".to_string()))?;
        info!(project = %latest, "resolved most recent scan");
        Ok(latest)
    }

    async fn persist(&self, run: &PipelineRun) {
        if let Err(e) = self.store.save(run).await {
            warn!(run_id = %run.run_id, error = %e, "failed to persist run record");
        }
    }

    async fn notify(&self, event: NotifyEvent) {
        deliver(self.notifier.as_ref(), event).await;
    }

    async fn execute_run(
        &self,
        mut run: PipelineRun,
        guard: ActiveRunGuard,
        token: &CancellationToken,
    ) -> PipelineRun {
        let run_id = run.run_id;
        if let Err(e) = self.drive(&mut run, token).await {
            error!(run_id = %run_id, error = %e, "run bookkeeping failed");
            if !run.status.is_terminal() {
                let _ = run.fail(RunError::from(&e));
            }
        }
        self.persist(&run).await;
        self.cancellations.remove(&run_id);
        drop(guard);
        run
    }

    async fn drive(&self, run: &mut PipelineRun, token: &CancellationToken) -> Result<(), PrintlineError> {
        let run_id = run.run_id;
        run.transition(RunStatus::Running)?;
        self.persist(run).await;
        info!(run_id = %run_id, project = %run.project_name, steps = self.registry.len(), "run started");
        self.notify(NotifyEvent::run_started(run_id, &run.project_name))
            .await;

        let mut vars = self.registry.vars().clone();
        vars.insert("project_name".to_string(), run.project_name.clone());
        vars.insert("run_id".to_string(), run_id.to_string());

        for step in self.registry.steps() {
            if let Some(reason) = token.reason().or_else(|| self.halt.reason()) {
                warn!(run_id = %run_id, next_step = %step.name, reason = %reason, "run aborted");
                return self
                    .finish_aborted(run, RunError::new(ErrorKind::Aborted, reason))
                    .await;
            }

            if !step.enabled {
                run.push_step(&step.name).skip()?;
                self.persist(run).await;
                info!(run_id = %run_id, step = %step.name, "step skipped");
                continue;
            }

            match self.run_step(run, step, &vars).await {
                Ok(outputs) => vars.extend(outputs),
                Err(e) if e.kind() == ErrorKind::Aborted => {
                    warn!(run_id = %run_id, step = %step.name, error = %e, "run interrupted");
                    return self.finish_aborted(run, RunError::from(&e)).await;
                }
                Err(e) => {
                    let record = RunError::from(&e);
                    run.fail(record.clone())?;
                    error!(run_id = %run_id, step = %step.name, kind = %record.kind, error = %record.message, "run failed");
                    self.notify(NotifyEvent::run_failed(run_id, minutes(run), &record.to_string()))
                        .await;
                    return Ok(());
                }
            }
        }

        run.transition(RunStatus::Succeeded)?;
        let elapsed = minutes(run);
        info!(run_id = %run_id, project = %run.project_name, elapsed_minutes = elapsed, "run succeeded");
        self.notify(NotifyEvent::run_succeeded(run_id, &run.project_name, elapsed))
            .await;
        Ok(())
    }

    async fn finish_aborted(&self, run: &mut PipelineRun, error: RunError) -> Result<(), PrintlineError> {
        run.transition(RunStatus::Aborted)?;
        let reason = error.message.clone();
        run.last_error = Some(error);
        self.notify(NotifyEvent::run_aborted(run.run_id, minutes(run), &reason))
            .await;
        Ok(())
    }

    /// Records the current step as interrupted by shutdown.
    async fn interrupt(
        &self,
        run: &mut PipelineRun,
        step: &StepDefinition,
        started: Instant,
    ) -> Result<OutputRefs, PrintlineError> {
        let reason = self.halt.reason().unwrap_or_else(|| "shutdown".to_string());
        let err = PrintlineError::Aborted(format!("interrupted: {reason}")).in_step(&step.name);
        current(run)?.fail(RunError::from(&err))?;
        self.persist(run).await;
        warn!(
            run_id = %run.run_id,
            step = %step.name,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "step interrupted"
        );
        Err(err)
    }

    /// Runs one step to a terminal result, retrying per its policy.
    async fn run_step(
        &self,
        run: &mut PipelineRun,
        step: &StepDefinition,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let run_id = run.run_id;
        run.push_step(&step.name).start()?;
        self.persist(run).await;
        self.notify(NotifyEvent::step_started(run_id, &step.name))
            .await;

        let started = Instant::now();
        let allowed = step.attempts_allowed();
        loop {
            let attempt = current(run)?.begin_attempt()?;
            debug!(run_id = %run_id, step = %step.name, attempt, allowed, "attempt started");

            let outcome = tokio::select! {
                result = self.executor.execute(step, vars) => result,
                () = self.halt.cancelled() => return self.interrupt(run, step, started).await,
            };
            match outcome {
                Ok(outputs) => {
                    current(run)?.succeed(outputs.clone())?;
                    self.persist(run).await;
                    let secs = started.elapsed().as_secs_f64();
                    info!(run_id = %run_id, step = %step.name, attempt, elapsed_secs = secs, "step succeeded");
                    self.notify(NotifyEvent::step_succeeded(run_id, &step.name, secs))
                        .await;
                    return Ok(outputs);
                }
                Err(e) if attempt < allowed && retry_allowed(&e) => {
                    let delay = step.backoff.delay_after(attempt);
                    warn!(
                        run_id = %run_id,
                        step = %step.name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.halt.cancelled() => return self.interrupt(run, step, started).await,
                    }
                }
                Err(e) => {
                    let err = e.in_step(&step.name);
                    let record = RunError::from(&err);
                    current(run)?.fail(record.clone())?;
                    self.persist(run).await;
                    let secs = started.elapsed().as_secs_f64();
                    warn!(run_id = %run_id, step = %step.name, attempt, elapsed_secs = secs, error = %err, "step failed");
                    self.notify(NotifyEvent::step_failed(run_id, &step.name, secs, &record.message))
                        .await;
                    return Err(err);
                }
            }
        }
    }
}

fn current(run: &mut PipelineRun) -> Result<&mut crate::core::StepResult, PrintlineError> {
    let run_id = run.run_id;
    run.current_step_mut()
        .ok_or_else(|| PrintlineError::Validation(format!("run {run_id} has no current step")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventKind, StepStatus};
    use crate::testing::{CollectingNotifier, ScriptedStepExecutor, StaticScanShare};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry(names: &[&str]) -> StepRegistry {
        let steps = names
            .iter()
            .map(|n| StepDefinition::command(*n, "true", Vec::<String>::new()))
            .collect();
        StepRegistry::new(steps, TemplateVars::new()).unwrap()
    }

    fn orchestrator(
        registry: StepRegistry,
        executor: Arc<ScriptedStepExecutor>,
    ) -> (Orchestrator, Arc<CollectingNotifier>) {
        let notifier = Arc::new(CollectingNotifier::new());
        let orchestrator = Orchestrator::builder(registry, executor)
            .notifier(notifier.clone())
            .build();
        (orchestrator, notifier)
    }

    #[tokio::test]
    async fn test_run_succeeds_in_order() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let (orchestrator, notifier) = orchestrator(registry(&["a", "b", "c"]), executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(executor.calls(), vec!["a", "b", "c"]);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        assert_eq!(notifier.count(EventKind::Start), 4);
        assert_eq!(notifier.count(EventKind::Success), 4);
        assert!(orchestrator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_steps() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.fail("b", || PrintlineError::CommandFailure {
            program: "slicer".to_string(),
            exit_code: Some(1),
            stderr: "bad mesh".to_string(),
        });
        let (orchestrator, notifier) = orchestrator(registry(&["a", "b", "c"]), executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(executor.calls(), vec!["a", "b"]);
        assert!(run.step("c").is_none());
        let last_error = run.last_error.unwrap();
        assert_eq!(last_error.kind, ErrorKind::CommandFailure);
        assert_eq!(last_error.step_name.as_deref(), Some("b"));

        let failures = notifier.of_kind(EventKind::Failure);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].step_name.as_deref(), Some("b"));
        assert!(failures[1].step_name.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success_reports_only_success() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.fail_times("fetch", 2, || PrintlineError::Connectivity("scanner".to_string()));
        let steps = vec![StepDefinition::command("fetch", "true", Vec::<String>::new())
            .with_retry(3, crate::steps::Backoff::constant(Duration::from_secs(30)))];
        let registry = StepRegistry::new(steps, TemplateVars::new()).unwrap();
        let (orchestrator, notifier) = orchestrator(registry, executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        let step = run.step("fetch").unwrap();
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.attempt_count, 3);
        assert_eq!(notifier.count(EventKind::Failure), 0);
        assert_eq!(executor.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_into_single_failure() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.fail_times("fetch", 5, || PrintlineError::Connectivity("scanner".to_string()));
        let steps = vec![StepDefinition::command("fetch", "true", Vec::<String>::new())
            .with_retry(2, crate::steps::Backoff::constant(Duration::from_secs(1)))];
        let registry = StepRegistry::new(steps, TemplateVars::new()).unwrap();
        let (orchestrator, notifier) = orchestrator(registry, executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].attempt_count, 2);
        assert_eq!(
            notifier
                .of_kind(EventKind::Failure)
                .iter()
                .filter(|e| e.step_name.is_some())
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_outputs_flow_into_later_steps() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.produce("reconstruct", [("mesh", "/r/owl.obj")]);
        let (orchestrator, _) = orchestrator(registry(&["reconstruct", "decimate"]), executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        assert_eq!(run.outputs()["mesh"], "/r/owl.obj");
        let seen = executor.vars_for("decimate").unwrap();
        assert_eq!(seen["mesh"], "/r/owl.obj");
        assert_eq!(seen["project_name"], "owl");
        assert_eq!(seen["run_id"], run.run_id.to_string());
    }

    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let steps = vec![
            StepDefinition::command("slice", "true", Vec::<String>::new()),
            StepDefinition::command("start_print", "true", Vec::<String>::new()).enabled(false),
        ];
        let registry = StepRegistry::new(steps, TemplateVars::new()).unwrap();
        let (orchestrator, _) = orchestrator(registry, executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.step("start_print").unwrap().status, StepStatus::Skipped);
        assert_eq!(executor.calls(), vec!["slice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_for_running_project_is_refused() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.delay("a", Duration::from_secs(60));
        let (orchestrator, _) = orchestrator(registry(&["a"]), executor.clone());

        let first = orchestrator.start_run(Some("owl".to_string())).await.unwrap();
        let err = orchestrator
            .start_run(Some("owl".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PrintlineError::Concurrency { active_run_id, .. } if active_run_id == first.run_id()
        ));

        let other = orchestrator.start_run(Some("fox".to_string())).await.unwrap();

        let run = first.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(other.wait().await.unwrap().status, RunStatus::Succeeded);
        assert!(orchestrator.start_run(Some("owl".to_string())).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_takes_effect_at_step_boundary() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.delay("a", Duration::from_secs(60));
        let (orchestrator, notifier) = orchestrator(registry(&["a", "b"]), executor.clone());

        let handle = orchestrator.start_run(Some("owl".to_string())).await.unwrap();
        let run_id = handle.run_id();
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.abort(run_id, "operator request").await.unwrap();

        let run = handle.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.step("a").unwrap().status, StepStatus::Succeeded);
        assert!(run.step("b").is_none());
        assert_eq!(executor.calls(), vec!["a"]);
        assert_eq!(run.last_error.unwrap().kind, ErrorKind::Aborted);
        assert_eq!(notifier.count(EventKind::Failure), 1);

        let err = orchestrator.abort(run_id, "again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_step_and_persists_aborted() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.delay("a", Duration::from_secs(3600));
        let (orchestrator, notifier) = orchestrator(registry(&["a", "b"]), executor.clone());

        let started = Instant::now();
        let handle = orchestrator.start_run(Some("owl".to_string())).await.unwrap();
        let run_id = handle.run_id();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(orchestrator.shutdown("interrupted").await, 1);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(orchestrator.active_runs().is_empty());

        let stored = orchestrator.get_status(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Aborted);
        assert!(stored.ended_at.is_some());
        let step = stored.step("a").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(stored.step("b").is_none());
        let last_error = stored.last_error.clone().unwrap();
        assert_eq!(last_error.kind, ErrorKind::Aborted);
        assert_eq!(last_error.step_name.as_deref(), Some("a"));
        assert_eq!(notifier.count(EventKind::Failure), 1);

        assert_eq!(handle.wait().await.unwrap(), stored);
        assert_eq!(executor.calls(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_backoff() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.fail_times("fetch", 5, || PrintlineError::Connectivity("scanner".to_string()));
        let steps = vec![StepDefinition::command("fetch", "true", Vec::<String>::new())
            .with_retry(3, crate::steps::Backoff::constant(Duration::from_secs(600)))];
        let registry = StepRegistry::new(steps, TemplateVars::new()).unwrap();
        let (orchestrator, _) = orchestrator(registry, executor.clone());

        let handle = orchestrator.start_run(Some("owl".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.shutdown("interrupted").await;

        let run = handle.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Aborted);
        assert_eq!(run.steps[0].attempt_count, 1);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_runs_accepted_after_shutdown() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let (orchestrator, _) = orchestrator(registry(&["a"]), executor.clone());

        assert_eq!(orchestrator.shutdown("stopping").await, 0);
        let err = orchestrator
            .start_run(Some("owl".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(executor.calls().is_empty());
        assert!(orchestrator.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_and_listing() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let (orchestrator, _) = orchestrator(registry(&["a"]), executor);

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();
        let stored = orchestrator.get_status(run.run_id).await.unwrap();
        assert_eq!(stored, run);
        assert_eq!(orchestrator.list_runs().await.unwrap().len(), 1);

        let err = orchestrator.get_status(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_missing_project_resolves_latest_scan() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let share = Arc::new(StaticScanShare::new().with_folders(["fox", "owl"]));
        let orchestrator = Orchestrator::builder(registry(&["a"]), executor)
            .resolver(share)
            .build();

        let run = orchestrator.run(None).await.unwrap();
        assert_eq!(run.project_name, "owl");
    }

    #[tokio::test]
    async fn test_missing_project_without_scans_is_not_found() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        let share = Arc::new(StaticScanShare::new().with_folders(Vec::<String>::new()));
        let orchestrator = Orchestrator::builder(registry(&["a"]), executor)
            .resolver(share)
            .build();

        let err = orchestrator.start_run(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let bare = Orchestrator::builder(registry(&["a"]), Arc::new(ScriptedStepExecutor::new())).build();
        assert_eq!(bare.start_run(None).await.unwrap_err().kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let executor = Arc::new(ScriptedStepExecutor::new());
        executor.fail("a", || PrintlineError::Validation("unknown variable".to_string()));
        let steps = vec![StepDefinition::command("a", "true", Vec::<String>::new())
            .with_retry(3, crate::steps::Backoff::constant(Duration::from_millis(1)))];
        let registry = StepRegistry::new(steps, TemplateVars::new()).unwrap();
        let (orchestrator, _) = orchestrator(registry, executor.clone());

        let run = orchestrator.run(Some("owl".to_string())).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(executor.calls().len(), 1);
    }
}
