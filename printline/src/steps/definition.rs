//! Declarative step descriptors.

use super::retry::Backoff;
use super::template::placeholders;
use crate::core::HostAffinity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where a command output's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSource {
    /// A templated artifact location.
    Template(String),
    /// The value of a `KEY=value` line printed on stdout.
    Captured {
        /// The key to look for.
        stdout_key: String,
    },
}

/// What a step does when executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a templated command on the step's host.
    Command {
        /// Program to run.
        program: String,
        /// Templated arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Outputs produced, keyed by output name.
        #[serde(default)]
        outputs: BTreeMap<String, OutputSource>,
    },
    /// Copy an artifact from the worker host to the orchestrating host.
    Pull {
        /// Templated path on the worker.
        remote: String,
        /// Templated destination on the orchestrating host.
        local: String,
        /// Output name that receives the local path.
        output: String,
    },
    /// Submit images for photogrammetry and wait for the mesh.
    CloudReconstruct {
        /// Templated local image directory.
        images: String,
        /// Templated directory the result is downloaded to.
        output_dir: String,
        /// Output name that receives the mesh path.
        output: String,
    },
    /// Resolve a host and check that a TCP port answers, from the step's
    /// host. Failure is a connectivity error.
    CheckPort {
        /// Templated host name.
        host: String,
        /// Port that must accept connections.
        port: u16,
        /// Output name that receives the resolved address.
        output: String,
    },
    /// Find the printer on the orchestrating host's network by its serial.
    LocatePrinter {
        /// Templated serial; empty accepts the first printer that answers.
        serial: String,
        /// Output name that receives the printer address.
        output: String,
    },
}

impl StepAction {
    /// Returns every template string this action renders.
    #[must_use]
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Command {
                program,
                args,
                outputs,
            } => {
                let mut all = vec![program.as_str()];
                all.extend(args.iter().map(String::as_str));
                all.extend(outputs.values().filter_map(|source| match source {
                    OutputSource::Template(t) => Some(t.as_str()),
                    OutputSource::Captured { .. } => None,
                }));
                all
            }
            Self::Pull { remote, local, .. } => vec![remote.as_str(), local.as_str()],
            Self::CloudReconstruct {
                images, output_dir, ..
            } => vec![images.as_str(), output_dir.as_str()],
            Self::CheckPort { host, .. } => vec![host.as_str()],
            Self::LocatePrinter { serial, .. } => vec![serial.as_str()],
        }
    }

    /// Returns the names of the outputs this action produces.
    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        match self {
            Self::Command { outputs, .. } => outputs.keys().cloned().collect(),
            Self::Pull { output, .. }
            | Self::CloudReconstruct { output, .. }
            | Self::CheckPort { output, .. }
            | Self::LocatePrinter { output, .. } => vec![output.clone()],
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_enabled() -> bool {
    true
}

/// Static descriptor of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step name.
    pub name: String,
    /// Host the step runs on.
    #[serde(default)]
    pub host_affinity: HostAffinity,
    /// Artifacts or variables this step consumes.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Whether failed attempts may be retried.
    #[serde(default)]
    pub retryable: bool,
    /// Maximum attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Bound on a single attempt, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Disabled steps are recorded as skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// What the step does.
    pub action: StepAction,
}

impl StepDefinition {
    /// Creates a step with default policy for the given action.
    #[must_use]
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            host_affinity: HostAffinity::Local,
            inputs: Vec::new(),
            retryable: false,
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            timeout_secs: default_timeout_secs(),
            enabled: true,
            action,
        }
    }

    /// Creates a command step.
    #[must_use]
    pub fn command<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            StepAction::Command {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
                outputs: BTreeMap::new(),
            },
        )
    }

    /// Sets the host affinity.
    #[must_use]
    pub fn on(mut self, affinity: HostAffinity) -> Self {
        self.host_affinity = affinity;
        self
    }

    /// Declares the inputs.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a command output. Ignored for non-command actions.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, source: OutputSource) -> Self {
        if let StepAction::Command { outputs, .. } = &mut self.action {
            outputs.insert(name.into(), source);
        }
        self
    }

    /// Makes the step retryable.
    #[must_use]
    pub fn with_retry(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.retryable = true;
        self.max_attempts = max_attempts;
        self.backoff = backoff;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Enables or disables the step.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the attempts allowed by the retry policy.
    #[must_use]
    pub fn attempts_allowed(&self) -> u32 {
        if self.retryable {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Returns the names of the outputs this step produces.
    #[must_use]
    pub fn outputs(&self) -> Vec<String> {
        self.action.output_names()
    }

    /// Returns every placeholder referenced by the action's templates.
    #[must_use]
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for template in self.action.templates() {
            for name in placeholders(template) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_allowed() {
        let step = StepDefinition::command("slice", "orca-slicer", ["--slice", "0"]);
        assert_eq!(step.attempts_allowed(), 1);

        let step = step.with_retry(3, Backoff::default());
        assert_eq!(step.attempts_allowed(), 3);

        let mut zero = StepDefinition::command("x", "true", Vec::<String>::new());
        zero.retryable = true;
        zero.max_attempts = 0;
        assert_eq!(zero.attempts_allowed(), 1);
    }

    #[test]
    fn test_referenced_variables() {
        let step = StepDefinition::command(
            "decimate",
            "docker",
            ["-v", "{local_dir}:/data", "--ratio", "{decimate_ratio}", "{mesh}"],
        )
        .with_output(
            "decimated_mesh",
            OutputSource::Template("{models_dir}/{project_name}_decimated.stl".to_string()),
        );

        assert_eq!(
            step.referenced_variables(),
            vec!["local_dir", "decimate_ratio", "mesh", "models_dir", "project_name"]
        );
        assert_eq!(step.outputs(), vec!["decimated_mesh".to_string()]);
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml_src = r#"
            name = "fetch_scan"
            host_affinity = "remote"
            inputs = ["project_name"]
            retryable = true
            max_attempts = 2
            timeout_secs = 120

            [action]
            type = "command"
            program = "fetch.sh"
            args = ["{project_name}"]

            [action.outputs]
            image_dir = { stdout_key = "RESULT_PATH" }
            log = "/tmp/{project_name}.log"
        "#;
        let step: StepDefinition = toml::from_str(toml_src).unwrap();

        assert_eq!(step.host_affinity, HostAffinity::Remote);
        assert_eq!(step.attempts_allowed(), 2);
        assert_eq!(step.timeout(), Duration::from_secs(120));
        assert!(step.enabled);
        match &step.action {
            StepAction::Command { outputs, .. } => {
                assert_eq!(
                    outputs.get("image_dir"),
                    Some(&OutputSource::Captured {
                        stdout_key: "RESULT_PATH".to_string()
                    })
                );
                assert_eq!(
                    outputs.get("log"),
                    Some(&OutputSource::Template("/tmp/{project_name}.log".to_string()))
                );
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_discovery_actions_from_toml() {
        let check: StepDefinition = toml::from_str(
            r#"
            name = "discover_scanner"
            host_affinity = "remote"
            [action]
            type = "check_port"
            host = "{scanner_host}"
            port = 445
            output = "scanner_ip"
            "#,
        )
        .unwrap();
        assert_eq!(check.referenced_variables(), vec!["scanner_host"]);
        assert_eq!(check.outputs(), vec!["scanner_ip".to_string()]);

        let locate: StepDefinition = toml::from_str(
            r#"
            name = "locate_printer"
            [action]
            type = "locate_printer"
            serial = "{printer_serial}"
            output = "printer_host"
            "#,
        )
        .unwrap();
        assert_eq!(locate.host_affinity, HostAffinity::Local);
        assert_eq!(locate.outputs(), vec!["printer_host".to_string()]);
    }
}
