//! Scan detection on the scanner share.

mod share;
#[allow(clippy::module_inception)]
mod watcher;

pub use share::{latest, parse_listing, ProjectResolver, ScanFolder, ScanShare, SmbScanShare};
pub use watcher::{PollOutcome, RunTrigger, ScanWatcher, WatcherState};
