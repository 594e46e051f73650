//! Configuration loaded from a TOML file.
//!
//! Every section has defaults so a minimal file only names the hosts and
//! credentials. [`PrintlineConfig::template_vars`] flattens the sections into
//! the variables consumed when the step registry is built.

use crate::core::HostAffinity;
use crate::errors::PrintlineError;
use crate::steps::{StepDefinition, TemplateVars};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dial-out identity of the worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker hostname or address. Remote steps are unavailable when unset.
    pub host: Option<String>,
    /// SSH user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key used to dial out.
    pub identity_file: Option<PathBuf>,
    /// SSH connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Scratch directory on the worker.
    pub work_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: "pi".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            work_dir: "/mnt/scandata".to_string(),
        }
    }
}

/// The scanner's file share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner hostname.
    pub host: String,
    /// SMB share name.
    pub share: String,
    /// SMB user.
    pub user: String,
    /// SMB password.
    pub password: String,
    /// Directory within the share holding one folder per scan.
    pub scan_path: String,
    /// Host that can reach the scanner.
    pub listing_affinity: HostAffinity,
    /// Bound on one listing call, in seconds.
    pub listing_timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            host: "openscan.local".to_string(),
            share: "PiShare".to_string(),
            user: "pi".to_string(),
            password: "raspberry".to_string(),
            scan_path: "OpenScan/scans".to_string(),
            listing_affinity: HostAffinity::Remote,
            listing_timeout_secs: 10,
        }
    }
}

/// The photogrammetry cloud service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Service base URL.
    pub server: String,
    /// API token.
    pub token: String,
    /// Basic-auth user.
    pub user: String,
    /// Basic-auth password.
    pub password: String,
    /// Seconds between status polls.
    pub poll_interval_secs: u64,
    /// Maximum seconds to wait for a job.
    pub max_wait_secs: u64,
    /// Immediate retries of a poll on transport errors.
    pub transient_retries: u32,
    /// Largest upload part in bytes.
    pub max_part_size: u64,
    /// Bound on one HTTP request, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server: "http://openscanfeedback.dnsuser.de:1334/".to_string(),
            token: String::new(),
            user: "openscan".to_string(),
            password: "free".to_string(),
            poll_interval_secs: 60,
            max_wait_secs: 3600,
            transient_retries: 3,
            max_part_size: 200_000_000,
            request_timeout_secs: 300,
        }
    }
}

impl CloudConfig {
    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the maximum wait.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Mesh simplification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Fraction of faces kept, 0.0 to 1.0.
    pub decimate_ratio: f64,
    /// Container image providing headless Blender.
    pub docker_image: String,
    /// Decimation script, relative to the local data directory.
    pub script: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            decimate_ratio: 0.5,
            docker_image: "nytimes/blender:latest".to_string(),
            script: "scripts/decimate_and_export.py".to_string(),
        }
    }
}

/// Slicer invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerConfig {
    /// Slicer executable.
    pub binary: String,
    /// Named settings profile (machine;process).
    pub profile: String,
    /// Filament settings.
    pub filament: String,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            binary: "orca-slicer".to_string(),
            profile: "profiles/machine.json;profiles/process.json".to_string(),
            filament: "profiles/filament.json".to_string(),
        }
    }
}

/// Networked printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Printer address. When unset the printer is found by an SSDP search
    /// for its serial.
    pub host: Option<String>,
    /// Printer serial, used in control topics and discovery.
    pub serial: String,
    /// LAN access code.
    pub access_code: String,
    /// Implicit FTPS port for uploads.
    pub upload_port: u16,
    /// Control channel port.
    pub control_port: u16,
    /// When false the start-print step is skipped and the upload left on
    /// the printer for a manual start.
    pub auto_start: bool,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            host: None,
            serial: String::new(),
            access_code: String::new(),
            upload_port: 990,
            control_port: 8883,
            auto_start: true,
        }
    }
}

/// Notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Whether to deliver notifications externally.
    pub enabled: bool,
    /// Messaging CLI.
    pub program: String,
    /// Channel name passed to the CLI.
    pub channel: String,
    /// Destination identifier. Delivery is skipped when empty.
    pub target: String,
    /// Host the messaging CLI lives on.
    pub affinity: HostAffinity,
    /// Bound on one delivery, in seconds.
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "openclaw".to_string(),
            channel: "telegram".to_string(),
            target: String::new(),
            affinity: HostAffinity::Remote,
            timeout_secs: 30,
        }
    }
}

/// Scan watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Seconds between share listings.
    pub poll_interval_secs: u64,
    /// Treat folders present at the first successful listing as already
    /// handled.
    pub baseline_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            baseline_existing: false,
        }
    }
}

/// Local directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for scans, results and models on the orchestrating host.
    pub local_dir: PathBuf,
    /// Where run records are written. Defaults to `<local_dir>/state`.
    pub state_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("3d-pipeline"),
            state_dir: None,
        }
    }
}

impl PathsConfig {
    /// Returns the run-record directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.local_dir.join("state"))
    }

    /// Returns the directory of per-project lock files shared by every
    /// printline process using this configuration.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintlineConfig {
    /// Worker host.
    pub worker: WorkerConfig,
    /// Scanner share.
    pub scanner: ScannerConfig,
    /// Cloud service.
    pub cloud: CloudConfig,
    /// Mesh simplification.
    pub mesh: MeshConfig,
    /// Slicer.
    pub slicer: SlicerConfig,
    /// Printer.
    pub printer: PrinterConfig,
    /// Notifications.
    pub notify: NotifyConfig,
    /// Watcher.
    pub watcher: WatcherConfig,
    /// Local paths.
    pub paths: PathsConfig,
    /// Extra template variables; override the derived ones.
    pub vars: BTreeMap<String, String>,
    /// Replaces the stock step list when non-empty.
    pub steps: Vec<StepDefinition>,
}

impl PrintlineConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PrintlineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PrintlineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Parses and validates a TOML configuration string.
    pub fn from_toml(raw: &str) -> Result<Self, PrintlineError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), PrintlineError> {
        if !(0.0..=1.0).contains(&self.mesh.decimate_ratio) {
            return Err(PrintlineError::Config(format!(
                "mesh.decimate_ratio must be between 0.0 and 1.0, got {}",
                self.mesh.decimate_ratio
            )));
        }
        if self.cloud.poll_interval_secs == 0 {
            return Err(PrintlineError::Config(
                "cloud.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.cloud.max_wait_secs < self.cloud.poll_interval_secs {
            return Err(PrintlineError::Config(
                "cloud.max_wait_secs must be at least cloud.poll_interval_secs".to_string(),
            ));
        }
        if self.watcher.poll_interval_secs == 0 {
            return Err(PrintlineError::Config(
                "watcher.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.worker.host.as_deref().is_some_and(str::is_empty) {
            return Err(PrintlineError::Config(
                "worker.host must not be empty".to_string(),
            ));
        }
        if self.printer.host.as_deref().is_some_and(str::is_empty) {
            return Err(PrintlineError::Config(
                "printer.host must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the watcher poll interval.
    #[must_use]
    pub fn watcher_interval(&self) -> Duration {
        Duration::from_secs(self.watcher.poll_interval_secs)
    }

    /// Flattens the configuration into step template variables.
    #[must_use]
    pub fn template_vars(&self) -> TemplateVars {
        let local = &self.paths.local_dir;
        let mut vars = TemplateVars::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set("worker_dir", self.worker.work_dir.clone());
        set("worker_scans_dir", format!("{}/scans", self.worker.work_dir));
        set("scanner_host", self.scanner.host.clone());
        set("scanner_share", self.scanner.share.clone());
        set("scanner_user", self.scanner.user.clone());
        set("scanner_password", self.scanner.password.clone());
        set("scan_path", self.scanner.scan_path.clone());
        set("local_dir", local.display().to_string());
        set("scans_dir", local.join("scans").display().to_string());
        set("results_dir", local.join("results").display().to_string());
        set("models_dir", local.join("models").display().to_string());
        set("decimate_ratio", self.mesh.decimate_ratio.to_string());
        set("blender_image", self.mesh.docker_image.clone());
        set("blender_script", self.mesh.script.clone());
        set("slicer_bin", self.slicer.binary.clone());
        set("slicer_profile", self.slicer.profile.clone());
        set("slicer_filament", self.slicer.filament.clone());
        if let Some(host) = &self.printer.host {
            set("printer_host", host.clone());
        }
        set("printer_serial", self.printer.serial.clone());
        set("printer_access_code", self.printer.access_code.clone());
        set("printer_upload_port", self.printer.upload_port.to_string());
        set("printer_control_port", self.printer.control_port.to_string());

        vars.extend(self.vars.clone());
        vars
    }
}
