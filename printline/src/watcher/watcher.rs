//! The polling loop that turns new scan folders into runs.

use super::share::ScanShare;
use crate::cancellation::CancellationToken;
use crate::core::{EventKind, NotifyEvent};
use crate::errors::{ErrorKind, PrintlineError};
use crate::notify::{deliver, Notifier};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The watcher's view of the orchestrator.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    /// Starts a run for `project_name` without waiting for it to finish.
    async fn trigger(&self, project_name: &str) -> Result<Uuid, PrintlineError>;
}

/// Where the watcher is within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatcherState {
    /// Sleeping between polls.
    #[default]
    Idle,
    /// Listing the share.
    Polling,
    /// Starting runs for new folders.
    TriggerRun,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::TriggerRun => write!(f, "trigger_run"),
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Projects a run was started for, in trigger order.
    pub triggered: Vec<String>,
    /// Whether the share answered.
    pub reachable: bool,
}

/// Watches the scanner share and triggers one run per new folder.
///
/// A folder name triggers at most once for the lifetime of the watcher,
/// whether or not its run succeeds.
pub struct ScanWatcher {
    share: Arc<dyn ScanShare>,
    trigger: Arc<dyn RunTrigger>,
    notifier: Arc<dyn Notifier>,
    seen: HashSet<String>,
    state: WatcherState,
    baseline_existing: bool,
    baselined: bool,
}

impl fmt::Debug for ScanWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanWatcher")
            .field("seen", &self.seen.len())
            .field("state", &self.state)
            .field("baseline_existing", &self.baseline_existing)
            .finish_non_exhaustive()
    }
}

impl ScanWatcher {
    /// Creates a watcher with an empty seen set.
    #[must_use]
    pub fn new(
        share: Arc<dyn ScanShare>,
        trigger: Arc<dyn RunTrigger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            share,
            trigger,
            notifier,
            seen: HashSet::new(),
            state: WatcherState::Idle,
            baseline_existing: false,
            baselined: false,
        }
    }

    /// Treats folders present at the first successful listing as already seen.
    #[must_use]
    pub fn baseline_existing(mut self, enabled: bool) -> Self {
        self.baseline_existing = enabled;
        self
    }

    /// Current cycle state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Whether `name` has already been handled.
    #[must_use]
    pub fn has_seen(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    /// Runs one listing cycle.
    ///
    /// An unreachable share is logged and otherwise ignored. Any other
    /// listing error is reported through the notifier.
    pub async fn poll_once(&mut self) -> PollOutcome {
        self.state = WatcherState::Polling;

        let folders = match self.share.list_folders().await {
            Ok(folders) => folders,
            Err(e) if e.kind() == ErrorKind::Connectivity => {
                debug!(error = %e, "scanner share unreachable, skipping cycle");
                self.state = WatcherState::Idle;
                return PollOutcome::default();
            }
            Err(e) => {
                warn!(error = %e, "scan listing failed");
                deliver(
                    self.notifier.as_ref(),
                    NotifyEvent::new(EventKind::Failure, format!("Watcher listing failed: {e}")),
                )
                .await;
                self.state = WatcherState::Idle;
                return PollOutcome::default();
            }
        };

        let mut outcome = PollOutcome {
            triggered: Vec::new(),
            reachable: true,
        };

        if self.baseline_existing && !self.baselined {
            self.baselined = true;
            self.seen.extend(folders.into_iter().map(|f| f.name));
            info!(known = self.seen.len(), "baselined existing scans");
            self.state = WatcherState::Idle;
            return outcome;
        }
        self.baselined = true;

        let mut fresh: Vec<_> = folders
            .into_iter()
            .filter(|f| !self.seen.contains(&f.name))
            .collect();
        fresh.sort_by(|a, b| a.name.cmp(&b.name));
        fresh.dedup_by(|a, b| a.name == b.name);

        for folder in fresh {
            self.state = WatcherState::TriggerRun;
            self.seen.insert(folder.name.clone());
            info!(project = %folder.name, images = folder.image_count, "new scan detected");
            deliver(
                self.notifier.as_ref(),
                NotifyEvent::new(
                    EventKind::Start,
                    format!(
                        "New scan detected: {} ({} images), starting pipeline",
                        folder.name, folder.image_count
                    ),
                ),
            )
            .await;

            match self.trigger.trigger(&folder.name).await {
                Ok(run_id) => {
                    info!(project = %folder.name, run_id = %run_id, "run triggered");
                    outcome.triggered.push(folder.name);
                }
                Err(e @ PrintlineError::Concurrency { .. }) => {
                    info!(project = %folder.name, error = %e, "run already active, not triggering");
                }
                Err(e) => {
                    warn!(project = %folder.name, error = %e, "failed to trigger run");
                    deliver(
                        self.notifier.as_ref(),
                        NotifyEvent::new(
                            EventKind::Failure,
                            format!("Could not start pipeline for '{}': {e}", folder.name),
                        ),
                    )
                    .await;
                }
            }
        }

        self.state = WatcherState::Idle;
        outcome
    }

    /// Polls every `poll_interval` until `stop` is cancelled.
    ///
    /// The first poll happens immediately.
    pub async fn run_forever(&mut self, poll_interval: Duration, stop: &CancellationToken) {
        info!(interval_secs = poll_interval.as_secs(), "watcher started");
        deliver(
            self.notifier.as_ref(),
            NotifyEvent::new(EventKind::Start, "Watcher started, monitoring for new scans"),
        )
        .await;

        while !stop.is_cancelled() {
            let outcome = self.poll_once().await;
            debug!(
                reachable = outcome.reachable,
                triggered = outcome.triggered.len(),
                "watch cycle finished"
            );

            tokio::select! {
                () = tokio::time::sleep(poll_interval) => {}
                () = stop.cancelled() => break,
            }
        }

        self.state = WatcherState::Idle;
        info!(reason = ?stop.reason(), "watcher stopped");
    }
}
