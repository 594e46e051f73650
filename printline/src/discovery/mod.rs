//! Finding the scanner and the printer on the local network.
//!
//! The scanner is checked from the host that fetches scans: its name is
//! resolved and the SMB port checked before any transfer starts. The printer
//! answers SSDP searches with its serial, so a run can find it when no
//! address is configured.

mod reach;
mod ssdp;

pub use reach::{reachability_command, CONNECT_WAIT, RESOLVED_ADDR_KEY};
pub use ssdp::{parse_response, search_request, SsdpLocator};

use crate::errors::PrintlineError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Finds a device's address from its serial.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceLocator: Send + Sync {
    /// Searches for `serial` for at most `window`. An empty serial accepts
    /// the first matching device. `Ok(None)` means nothing answered.
    async fn locate(&self, serial: &str, window: Duration) -> Result<Option<IpAddr>, PrintlineError>;
}
