//! Notification delivery.
//!
//! Every component reports through a [`Notifier`]. Delivery is fire and
//! forget: [`deliver`] logs a failed notification and carries on, so a
//! broken channel never stops a run.

mod command;

pub use command::CommandNotifier;

use crate::core::{EventKind, NotifyEvent};
use crate::executor::ExecError;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The channel refused or dropped the message.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The delivery command could not run.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// A destination for notification events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event.
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError>;
}

/// Delivers `event`, logging instead of failing when delivery breaks.
pub async fn deliver(notifier: &dyn Notifier, event: NotifyEvent) {
    if let Err(e) = notifier.notify(&event).await {
        warn!(
            run_id = ?event.run_id,
            step = ?event.step_name,
            kind = %event.kind,
            error = %e,
            "notification not delivered"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _event: &NotifyEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Mirrors events into the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        match event.kind {
            EventKind::Failure => warn!(
                run_id = ?event.run_id,
                step = ?event.step_name,
                "{event}"
            ),
            EventKind::Start | EventKind::Success => info!(
                run_id = ?event.run_id,
                step = ?event.step_name,
                "{event}"
            ),
        }
        Ok(())
    }
}

/// Sends every event to each wrapped notifier.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for FanoutNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutNotifier")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

impl FanoutNotifier {
    /// Creates an empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a notifier.
    #[must_use]
    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Number of wrapped notifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Whether no notifiers are wrapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    /// Delivers to every notifier concurrently and reports the first failure.
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        join_all(self.notifiers.iter().map(|n| n.notify(event)))
            .await
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingNotifier;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _event: &NotifyEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("channel down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_accept_everything() {
        let event = NotifyEvent::new(EventKind::Failure, "scanner offline");
        assert!(NoOpNotifier.notify(&event).await.is_ok());
        assert!(LoggingNotifier.notify(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_despite_failure() {
        let collector = Arc::new(CollectingNotifier::new());
        let fanout = FanoutNotifier::new()
            .with(Arc::new(Broken))
            .with(collector.clone());

        let result = fanout
            .notify(&NotifyEvent::new(EventKind::Start, "Watcher started"))
            .await;

        assert!(matches!(result, Err(NotifyError::Delivery(_))));
        assert_eq!(collector.len(), 1);
        assert_eq!(fanout.len(), 2);
    }

    #[tokio::test]
    async fn test_deliver_swallows_errors() {
        deliver(&Broken, NotifyEvent::new(EventKind::Success, "done")).await;
    }
}
