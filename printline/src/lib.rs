//! # Printline
//!
//! Orchestrates a scan-to-print line: a new scan folder appears on the
//! scanner share, its images go to a photogrammetry service, and the
//! resulting mesh is simplified, sliced and sent to a networked printer.
//!
//! The crate provides:
//!
//! - **Step registry**: the pipeline as an ordered list of declarative steps
//! - **Orchestrator**: a fail-fast run state machine with per-step retry,
//!   one active run per project, and persisted run records
//! - **Remote executor**: local processes and dial-out SSH to a worker host
//! - **Cloud job poller**: bounded submit-poll-download over the cloud API
//! - **Discovery**: scanner reachability and SSDP printer search
//! - **Scan watcher**: a polling loop that triggers one run per new folder
//! - **Notifier**: fire-and-forget status events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use printline::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PrintlineConfig::load("printline.toml")?;
//! let registry = StepRegistry::from_config(&config)?;
//! let executor = Arc::new(RemoteExecutor::from_config(&config.worker));
//! let poller = CloudJobPoller::new(
//!     Arc::new(OpenScanCloudClient::from_config(&config.cloud)?),
//!     PollPolicy::from_config(&config.cloud),
//! );
//!
//! let orchestrator = Orchestrator::builder(registry, Arc::new(StepDispatcher::new(executor, poller)))
//!     .store(Arc::new(JsonFileRunStore::new(config.paths.state_dir())))
//!     .build();
//!
//! let run = orchestrator.run(Some("owl".to_string())).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cloud;
pub mod config;
pub mod core;
pub mod discovery;
pub mod errors;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod steps;
pub mod testing;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::cloud::{
        CloudJob, CloudJobPoller, CloudJobState, OpenScanCloudClient, PhotogrammetryApi,
        PollPolicy, Submission,
    };
    pub use crate::config::PrintlineConfig;
    pub use crate::core::{
        EventKind, HostAffinity, NotifyEvent, OutputRefs, PipelineRun, RunStatus, StepResult,
        StepStatus,
    };
    pub use crate::discovery::{DeviceLocator, SsdpLocator};
    pub use crate::errors::{ErrorKind, PrintlineError, RunError};
    pub use crate::executor::{CommandExecutor, CommandOutput, CommandSpec, RemoteExecutor};
    pub use crate::notify::{
        CommandNotifier, FanoutNotifier, LoggingNotifier, NoOpNotifier, Notifier,
    };
    pub use crate::orchestrator::{
        InMemoryRunStore, JsonFileRunStore, Orchestrator, RunHandle, RunStore, StepDispatcher,
        StepExecutor,
    };
    pub use crate::steps::{Backoff, StepAction, StepDefinition, StepRegistry};
    pub use crate::watcher::{ProjectResolver, RunTrigger, ScanShare, ScanWatcher, SmbScanShare};
}
