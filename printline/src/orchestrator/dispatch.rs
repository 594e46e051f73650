//! Executes one attempt of a step against the executor, the cloud poller or
//! the printer locator.

use crate::cloud::{CloudJobPoller, Submission};
use crate::core::{HostAffinity, OutputRefs};
use crate::discovery::{reachability_command, DeviceLocator, SsdpLocator, CONNECT_WAIT, RESOLVED_ADDR_KEY};
use crate::errors::PrintlineError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::steps::{render, OutputSource, StepAction, StepDefinition, TemplateVars};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs a single attempt of a step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executes `step` with `vars` and returns the outputs it produced.
    async fn execute(&self, step: &StepDefinition, vars: &TemplateVars) -> Result<OutputRefs, PrintlineError>;
}

/// Routes host-bound work to the [`CommandExecutor`], photogrammetry to
/// the [`CloudJobPoller`] and printer searches to a [`DeviceLocator`].
#[derive(Clone)]
pub struct StepDispatcher {
    executor: Arc<dyn CommandExecutor>,
    poller: CloudJobPoller,
    locator: Arc<dyn DeviceLocator>,
}

impl std::fmt::Debug for StepDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDispatcher")
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl StepDispatcher {
    /// Creates a dispatcher that searches for printers over SSDP.
    #[must_use]
    pub fn new(executor: Arc<dyn CommandExecutor>, poller: CloudJobPoller) -> Self {
        Self {
            executor,
            poller,
            locator: Arc::new(SsdpLocator::default()),
        }
    }

    /// Replaces the printer locator.
    #[must_use]
    pub fn with_locator(mut self, locator: Arc<dyn DeviceLocator>) -> Self {
        self.locator = locator;
        self
    }

    async fn run_command(
        &self,
        step: &StepDefinition,
        program: &str,
        args: &[String],
        outputs: &std::collections::BTreeMap<String, OutputSource>,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let spec = CommandSpec {
            program: render(program, vars)?,
            args: args
                .iter()
                .map(|a| render(a, vars))
                .collect::<Result<_, _>>()?,
        };

        let mut produced = OutputRefs::new();
        for (name, source) in outputs {
            if let OutputSource::Template(template) = source {
                produced.insert(name.clone(), render(template, vars)?);
            }
        }
        if step.host_affinity == HostAffinity::Local {
            prepare_local_outputs(produced.values(), vars).await?;
        }

        let output = self
            .executor
            .execute(step.host_affinity, &spec, step.timeout())
            .await?
            .into_success(&spec.program)?;

        for (name, source) in outputs {
            if let OutputSource::Captured { stdout_key } = source {
                let value = output.captured(stdout_key).ok_or_else(|| PrintlineError::CommandFailure {
                    program: spec.program.clone(),
                    exit_code: output.exit_code,
                    stderr: format!("no {stdout_key}= line in output"),
                })?;
                produced.insert(name.clone(), value);
            }
        }
        Ok(produced)
    }

    async fn run_pull(
        &self,
        step: &StepDefinition,
        remote: &str,
        local: &str,
        output: &str,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let remote = render(remote, vars)?;
        let local = render(local, vars)?;
        self.executor
            .pull(&remote, Path::new(&local), step.timeout())
            .await?;
        Ok(OutputRefs::from([(output.to_string(), local)]))
    }

    async fn run_port_check(
        &self,
        step: &StepDefinition,
        host: &str,
        port: u16,
        output: &str,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let host = render(host, vars)?;
        let spec = reachability_command(&host, port, CONNECT_WAIT);
        let result = self
            .executor
            .execute(step.host_affinity, &spec, step.timeout())
            .await?;
        if !result.success() {
            return Err(PrintlineError::Connectivity(format!(
                "{host}:{port} unreachable: {}",
                result.stderr_tail()
            )));
        }

        let addr = result.captured(RESOLVED_ADDR_KEY).unwrap_or_else(|| host.clone());
        info!(%host, %addr, port, "host reachable");
        Ok(OutputRefs::from([(output.to_string(), addr)]))
    }

    async fn run_locate(
        &self,
        step: &StepDefinition,
        serial: &str,
        output: &str,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let serial = render(serial, vars)?;
        match self.locator.locate(&serial, step.timeout()).await? {
            Some(addr) => Ok(OutputRefs::from([(output.to_string(), addr.to_string())])),
            None if serial.is_empty() => Err(PrintlineError::Connectivity(
                "no printer answered discovery".to_string(),
            )),
            None => Err(PrintlineError::Connectivity(format!(
                "printer {serial} did not answer discovery"
            ))),
        }
    }

    async fn run_reconstruct(
        &self,
        step: &StepDefinition,
        images: &str,
        output_dir: &str,
        output: &str,
        vars: &TemplateVars,
    ) -> Result<OutputRefs, PrintlineError> {
        let images = PathBuf::from(render(images, vars)?);
        let output_dir = PathBuf::from(render(output_dir, vars)?);
        tokio::fs::create_dir_all(&output_dir).await?;

        let submission = Submission {
            label: vars
                .get("project_name")
                .cloned()
                .unwrap_or_else(|| step.name.clone()),
            images,
            work_dir: output_dir.clone(),
        };
        let mesh = tokio::time::timeout(step.timeout(), self.poller.reconstruct(&submission, &output_dir))
            .await
            .map_err(|_| PrintlineError::Timeout {
                operation: format!("step {}", step.name),
                after: step.timeout(),
            })??;

        Ok(OutputRefs::from([(output.to_string(), mesh.display().to_string())]))
    }
}

/// Creates the parent directories of output paths under `local_dir`.
async fn prepare_local_outputs<'a>(
    paths: impl Iterator<Item = &'a String>,
    vars: &TemplateVars,
) -> Result<(), PrintlineError> {
    let Some(root) = vars.get("local_dir").map(PathBuf::from) else {
        return Ok(());
    };
    for path in paths {
        let path = Path::new(path);
        if let Some(parent) = path.parent().filter(|p| p.starts_with(&root)) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl StepExecutor for StepDispatcher {
    async fn execute(&self, step: &StepDefinition, vars: &TemplateVars) -> Result<OutputRefs, PrintlineError> {
        debug!(step = %step.name, affinity = %step.host_affinity, "dispatching step");
        match &step.action {
            StepAction::Command {
                program,
                args,
                outputs,
            } => self.run_command(step, program, args, outputs, vars).await,
            StepAction::Pull {
                remote,
                local,
                output,
            } => self.run_pull(step, remote, local, output, vars).await,
            StepAction::CloudReconstruct {
                images,
                output_dir,
                output,
            } => self.run_reconstruct(step, images, output_dir, output, vars).await,
            StepAction::CheckPort { host, port, output } => {
                self.run_port_check(step, host, *port, output, vars).await
            }
            StepAction::LocatePrinter { serial, output } => {
                self.run_locate(step, serial, output, vars).await
            }
        }
    }
}
