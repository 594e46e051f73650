//! Notifications through an external messaging CLI.

use super::{NotifyError, Notifier};
use crate::config::NotifyConfig;
use crate::core::{HostAffinity, NotifyEvent};
use crate::executor::{CommandExecutor, CommandSpec};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends events with a messaging CLI such as
/// `openclaw message send --channel telegram --target <t> --message <m>`.
#[derive(Clone)]
pub struct CommandNotifier {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    channel: String,
    target: String,
    affinity: HostAffinity,
    timeout: Duration,
}

impl std::fmt::Debug for CommandNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandNotifier")
            .field("program", &self.program)
            .field("channel", &self.channel)
            .field("target", &self.target)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

impl CommandNotifier {
    /// Creates a notifier from the notify section.
    #[must_use]
    pub fn from_config(config: &NotifyConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            program: config.program.clone(),
            channel: config.channel.clone(),
            target: config.target.clone(),
            affinity: config.affinity,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// The command that delivers `event`.
    #[must_use]
    pub fn command_for(&self, event: &NotifyEvent) -> CommandSpec {
        CommandSpec::new(
            self.program.clone(),
            [
                "message".to_string(),
                "send".to_string(),
                "--channel".to_string(),
                self.channel.clone(),
                "--target".to_string(),
                self.target.clone(),
                "--message".to_string(),
                event.to_string(),
            ],
        )
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        if self.target.is_empty() {
            debug!("notification skipped: no target configured");
            return Ok(());
        }

        let output = self
            .executor
            .execute(self.affinity, &self.command_for(event), self.timeout)
            .await?;
        if !output.success() {
            return Err(NotifyError::Delivery(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.exit_code,
                output.stderr_tail()
            )));
        }
        Ok(())
    }
}
