//! Ordered, validated list of step definitions.

use super::definition::{OutputSource, StepAction, StepDefinition};
use super::retry::Backoff;
use super::template::TemplateVars;
use crate::config::PrintlineConfig;
use crate::core::HostAffinity;
use crate::errors::PrintlineError;
use std::collections::HashSet;
use std::time::Duration;

/// Variables every run provides in addition to the configured ones.
pub const RUN_VARIABLES: [&str; 2] = ["project_name", "run_id"];

/// Port the scanner's file share listens on.
const SMB_PORT: u16 = 445;

/// The ordered step sequence consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
    vars: TemplateVars,
}

impl StepRegistry {
    /// Validates `steps` against the externally provided `vars`.
    ///
    /// # Errors
    ///
    /// Returns `PrintlineError::Validation` if the list is empty, a name is
    /// repeated, a printer search is not local, a retry policy allows no
    /// attempts, or an enabled step uses a
    /// value that is neither external nor produced by an earlier enabled step.
    pub fn new(steps: Vec<StepDefinition>, vars: TemplateVars) -> Result<Self, PrintlineError> {
        if steps.is_empty() {
            return Err(PrintlineError::Validation(
                "step registry must contain at least one step".to_string(),
            ));
        }

        let mut available: HashSet<String> = vars.keys().cloned().collect();
        available.extend(RUN_VARIABLES.iter().map(ToString::to_string));

        let mut names = HashSet::new();
        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(PrintlineError::Validation(
                    "step name must not be empty".to_string(),
                ));
            }
            if !names.insert(step.name.as_str()) {
                return Err(PrintlineError::Validation(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if matches!(step.action, StepAction::LocatePrinter { .. })
                && step.host_affinity != HostAffinity::Local
            {
                return Err(PrintlineError::Validation(format!(
                    "step '{}' searches the orchestrating host's network and must be local",
                    step.name
                )));
            }
            if step.retryable && step.max_attempts == 0 {
                return Err(PrintlineError::Validation(format!(
                    "step '{}' is retryable but allows no attempts",
                    step.name
                )));
            }
            if !step.enabled {
                continue;
            }

            let needed = step
                .inputs
                .iter()
                .cloned()
                .chain(step.referenced_variables());
            for name in needed {
                if !available.contains(&name) {
                    return Err(PrintlineError::Validation(format!(
                        "step '{}' uses '{name}', which no earlier step produces",
                        step.name
                    )));
                }
            }
            available.extend(step.outputs());
        }

        Ok(Self { steps, vars })
    }

    /// Builds the registry from configuration, falling back to the stock
    /// photogrammetry line when no steps are configured.
    pub fn from_config(config: &PrintlineConfig) -> Result<Self, PrintlineError> {
        let steps = if config.steps.is_empty() {
            default_pipeline(config)
        } else {
            config.steps.clone()
        };
        Self::new(steps, config.template_vars())
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Returns the external variables.
    #[must_use]
    pub fn vars(&self) -> &TemplateVars {
        &self.vars
    }

    /// Looks up a step by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a validated registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// The stock scan-to-print line.
///
/// The scanner port is checked first so an unreachable scanner fails fast. When no
/// printer address is configured a search step finds it before the upload.
#[must_use]
pub fn default_pipeline(config: &PrintlineConfig) -> Vec<StepDefinition> {
    let transient = Backoff::constant(Duration::from_secs(30));

    let discover_scanner = StepDefinition::new(
        "discover_scanner",
        StepAction::CheckPort {
            host: "{scanner_host}".to_string(),
            port: SMB_PORT,
            output: "scanner_ip".to_string(),
        },
    )
    .on(HostAffinity::Remote)
    .with_timeout(Duration::from_secs(30));

    let fetch_scan = StepDefinition::command(
        "fetch_scan",
        "sh",
        [
            "-c",
            r#"mkdir -p "$1" && smbclient "$2" -U "$3" -c "recurse; prompt; lcd $1; cd $4; mget *""#,
            "fetch_scan",
            "{worker_scans_dir}/{project_name}",
            "//{scanner_ip}/{scanner_share}",
            "{scanner_user}%{scanner_password}",
            "{scan_path}/{project_name}",
        ],
    )
    .on(HostAffinity::Remote)
    .with_inputs(["project_name", "scanner_ip"])
    .with_output(
        "worker_images",
        OutputSource::Template("{worker_scans_dir}/{project_name}".to_string()),
    )
    .with_retry(3, transient.clone())
    .with_timeout(Duration::from_secs(600));

    let pull_images = StepDefinition::new(
        "pull_images",
        StepAction::Pull {
            remote: "{worker_images}".to_string(),
            local: "{scans_dir}/{project_name}".to_string(),
            output: "images".to_string(),
        },
    )
    .on(HostAffinity::Remote)
    .with_inputs(["worker_images"])
    .with_retry(2, transient)
    .with_timeout(Duration::from_secs(300));

    let reconstruct = StepDefinition::new(
        "reconstruct",
        StepAction::CloudReconstruct {
            images: "{images}".to_string(),
            output_dir: "{results_dir}/{project_name}".to_string(),
            output: "mesh".to_string(),
        },
    )
    .with_inputs(["images"])
    .with_timeout(config.cloud.max_wait() + Duration::from_secs(600));

    let decimate = StepDefinition::command(
        "decimate",
        "docker",
        [
            "run",
            "--rm",
            "-v",
            "{local_dir}:{local_dir}",
            "{blender_image}",
            "blender",
            "-b",
            "-noaudio",
            "-P",
            "{local_dir}/{blender_script}",
            "--",
            "--ratio",
            "{decimate_ratio}",
            "--inm",
            "{mesh}",
            "--outm",
            "{models_dir}/{project_name}_decimated.stl",
        ],
    )
    .with_inputs(["mesh"])
    .with_output(
        "decimated_mesh",
        OutputSource::Template("{models_dir}/{project_name}_decimated.stl".to_string()),
    )
    .with_timeout(Duration::from_secs(600));

    let slice = StepDefinition::command(
        "slice",
        "{slicer_bin}",
        [
            "--debug",
            "5",
            "--no-check",
            "--slice",
            "0",
            "--load-settings",
            "{slicer_profile}",
            "--load-filaments",
            "{slicer_filament}",
            "{decimated_mesh}",
            "--export-3mf",
            "{models_dir}/{project_name}.3mf",
        ],
    )
    .with_inputs(["decimated_mesh"])
    .with_output(
        "print_package",
        OutputSource::Template("{models_dir}/{project_name}.3mf".to_string()),
    )
    .with_timeout(Duration::from_secs(300));

    let upload_print = StepDefinition::command(
        "upload_print",
        "curl",
        [
            "-sS",
            "-k",
            "--ftp-create-dirs",
            "--user",
            "bblp:{printer_access_code}",
            "-T",
            "{print_package}",
            "ftps://{printer_host}:{printer_upload_port}/cache/",
        ],
    )
    .with_inputs(["print_package"])
    .with_output(
        "printer_file",
        OutputSource::Template("/sdcard/cache/{project_name}.3mf".to_string()),
    )
    .with_retry(2, Backoff::constant(Duration::from_secs(10)))
    .with_timeout(Duration::from_secs(120));

    let start_print = StepDefinition::command(
        "start_print",
        "mosquitto_pub",
        [
            "-h",
            "{printer_host}",
            "-p",
            "{printer_control_port}",
            "-u",
            "bblp",
            "-P",
            "{printer_access_code}",
            "--insecure",
            "-t",
            "device/{printer_serial}/request",
            "-m",
            r#"{"print":{"sequence_id":"0","command":"project_file","param":"Metadata/plate_1.gcode","subtask_name":"{project_name}","url":"file://{printer_file}","bed_type":"auto","use_ams":false}}"#,
        ],
    )
    .with_inputs(["printer_file"])
    .with_timeout(Duration::from_secs(30))
    .enabled(config.printer.auto_start);

    let mut steps = vec![discover_scanner, fetch_scan, pull_images, reconstruct, decimate, slice];
    if config.printer.host.is_none() {
        steps.push(
            StepDefinition::new(
                "locate_printer",
                StepAction::LocatePrinter {
                    serial: "{printer_serial}".to_string(),
                    output: "printer_host".to_string(),
                },
            )
            .with_retry(2, Backoff::constant(Duration::from_secs(5)))
            .with_timeout(Duration::from_secs(10)),
        );
    }
    steps.push(upload_print);
    steps.push(start_print);
    steps
}
