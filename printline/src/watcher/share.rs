//! Scan folder listing on the scanner's SMB share.

use crate::config::ScannerConfig;
use crate::core::HostAffinity;
use crate::errors::PrintlineError;
use crate::executor::{CommandExecutor, CommandSpec, ExecError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Image extensions counted per folder.
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[allow(clippy::expect_used)]
static ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s+(?P<name>.+?)\s+(?P<attr>[A-Z]*)\s+(?P<size>\d+)\s+(?P<date>\w{3}\s+\w{3}\s+\d+\s+\d{1,2}:\d{2}:\d{2}\s+\d{4})\s*$",
    )
    .expect("entry pattern is valid")
});

/// A unit of scan work found on the share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFolder {
    /// Folder name, used as the project name.
    pub name: String,
    /// When this listing saw the folder.
    pub discovered_at: DateTime<Utc>,
    /// Images inside the folder.
    pub image_count: usize,
    /// Modification time reported by the share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<NaiveDateTime>,
}

impl ScanFolder {
    /// Creates a folder record discovered now.
    #[must_use]
    pub fn new(name: impl Into<String>, image_count: usize) -> Self {
        Self {
            name: name.into(),
            discovered_at: Utc::now(),
            image_count,
            modified_at: None,
        }
    }
}

/// Read-only view of the scanner's share.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScanShare: Send + Sync {
    /// Lists scan folders in share order.
    ///
    /// An unreachable share is reported as `PrintlineError::Connectivity`.
    async fn list_folders(&self) -> Result<Vec<ScanFolder>, PrintlineError>;
}

/// Resolves the project a manual run should process.
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// The most recent scan, if any.
    async fn latest_project(&self) -> Result<Option<String>, PrintlineError>;
}

#[async_trait]
impl<T: ScanShare + ?Sized> ProjectResolver for T {
    async fn latest_project(&self) -> Result<Option<String>, PrintlineError> {
        Ok(latest(&self.list_folders().await?).map(|f| f.name.clone()))
    }
}

/// Picks the newest folder by modification time, or the last listed one
/// when times are missing.
#[must_use]
pub fn latest(folders: &[ScanFolder]) -> Option<&ScanFolder> {
    if folders.iter().all(|f| f.modified_at.is_some()) {
        // max_by_key keeps the last of equal keys, matching listing order.
        folders.iter().max_by_key(|f| f.modified_at)
    } else {
        folders.last()
    }
}

/// Lists scans with `smbclient`, on whichever host can reach the scanner.
#[derive(Clone)]
pub struct SmbScanShare {
    executor: Arc<dyn CommandExecutor>,
    scanner: ScannerConfig,
}

impl std::fmt::Debug for SmbScanShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbScanShare")
            .field("host", &self.scanner.host)
            .field("share", &self.scanner.share)
            .field("scan_path", &self.scanner.scan_path)
            .finish_non_exhaustive()
    }
}

impl SmbScanShare {
    /// Creates a share view.
    #[must_use]
    pub fn new(scanner: ScannerConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor, scanner }
    }

    /// The recursive listing command.
    #[must_use]
    pub fn listing_command(&self) -> CommandSpec {
        CommandSpec::new(
            "smbclient",
            [
                format!("//{}/{}", self.scanner.host, self.scanner.share),
                "-U".to_string(),
                format!("{}%{}", self.scanner.user, self.scanner.password),
                "-c".to_string(),
                format!("recurse; ls {}/*", self.scanner.scan_path.trim_end_matches('/')),
            ],
        )
    }

    fn affinity(&self) -> HostAffinity {
        self.scanner.listing_affinity
    }
}

#[async_trait]
impl ScanShare for SmbScanShare {
    async fn list_folders(&self) -> Result<Vec<ScanFolder>, PrintlineError> {
        let timeout = Duration::from_secs(self.scanner.listing_timeout_secs.max(1));
        let unreachable = |detail: String| {
            PrintlineError::Connectivity(format!("scanner share {}: {detail}", self.scanner.host))
        };

        let output = match self
            .executor
            .execute(self.affinity(), &self.listing_command(), timeout)
            .await
        {
            Ok(output) => output,
            Err(ExecError::Timeout { .. }) => {
                return Err(unreachable(format!("listing exceeded {}s", timeout.as_secs())))
            }
            Err(e) => return Err(e.into()),
        };
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.lines().last().unwrap_or_default().to_string()
            } else {
                output.stderr_tail()
            };
            return Err(unreachable(detail));
        }

        Ok(parse_listing(&output.stdout, &self.scanner.scan_path))
    }
}

struct Entry<'a> {
    name: &'a str,
    is_dir: bool,
    modified_at: Option<NaiveDateTime>,
}

fn parse_entry(line: &str) -> Option<Entry<'_>> {
    let caps = ENTRY.captures(line)?;
    let name = caps.name("name")?.as_str();
    let date = caps.name("date")?.as_str();
    let date = date.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(Entry {
        name,
        is_dir: caps.name("attr")?.as_str().contains('D'),
        modified_at: NaiveDateTime::parse_from_str(&date, "%a %b %d %H:%M:%S %Y").ok(),
    })
}

/// Parses recursive `smbclient ls` output into scan folders.
///
/// Entries before the first `\dir` header are the scan folders themselves;
/// each header then introduces the contents of one folder (or a folder
/// nested inside it), whose images are counted toward the top-level folder.
#[must_use]
pub fn parse_listing(stdout: &str, scan_path: &str) -> Vec<ScanFolder> {
    let prefix = format!("\\{}\\", scan_path.trim_matches('/').replace('/', "\\"));
    let now = Utc::now();
    let mut folders: Vec<ScanFolder> = Vec::new();
    let mut current: Option<usize> = None;
    let mut in_header_section = false;

    for line in stdout.lines() {
        if line.starts_with('\\') {
            in_header_section = true;
            let header = line.trim_end();
            let relative = match (header.get(..prefix.len()), header.get(prefix.len()..)) {
                (Some(head), Some(rest)) if head.eq_ignore_ascii_case(&prefix) => rest,
                _ => header.rsplit('\\').next().unwrap_or_default(),
            };
            let top = relative.split('\\').next().unwrap_or_default();
            current = folders.iter().position(|f| f.name == top);
            continue;
        }

        let Some(entry) = parse_entry(line) else {
            continue;
        };
        if entry.name == "." || entry.name == ".." {
            continue;
        }

        if in_header_section {
            let is_image = !entry.is_dir
                && entry
                    .name
                    .rsplit_once('.')
                    .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(ext)));
            if let (true, Some(index)) = (is_image, current) {
                folders[index].image_count += 1;
            }
        } else if entry.is_dir {
            folders.push(ScanFolder {
                name: entry.name.to_string(),
                discovered_at: now,
                image_count: 0,
                modified_at: entry.modified_at,
            });
        }
    }
    folders
}
