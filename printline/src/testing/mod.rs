//! Testing utilities for printline orchestration.
//!
//! This module provides:
//! - A scripted step executor that records calls
//! - A collecting notifier
//! - A scripted scan share and a recording run trigger

mod mocks;

pub use mocks::{CollectingNotifier, RecordingTrigger, ScriptedStepExecutor, StaticScanShare};
