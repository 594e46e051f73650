//! Core domain model types for printline.
//!
//! This module contains the fundamental records shared by every component:
//! - Run and step status enums, host affinity
//! - Pipeline run and step result records
//! - Notification events

mod event;
mod run;
mod status;

pub use event::{EventKind, NotifyEvent};
pub use run::{OutputRefs, PipelineRun, StepResult};
pub use status::{HostAffinity, RunStatus, StepStatus};
