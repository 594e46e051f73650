//! The per-project active run registry.
//!
//! Claims are held in-process in a [`DashMap`] and, when a lock directory is
//! configured, also as an advisory file lock so a `run` and a `watch`
//! process sharing a state directory cannot process the same project at once.

use crate::errors::PrintlineError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Maps each busy project to the run holding it.
///
/// Claims are check-and-set through the map's entry API, so a manual
/// trigger racing the watcher cannot claim the same project twice.
#[derive(Debug, Clone, Default)]
pub struct ActiveRuns {
    slots: Arc<DashMap<String, Uuid>>,
    lock_dir: Option<PathBuf>,
}

impl ActiveRuns {
    /// Creates a registry that only guards this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that also takes `<lock_dir>/<project>.lock`.
    ///
    /// The file lock is released by the OS when the holding process exits,
    /// so a crashed holder never leaves a project blocked.
    #[must_use]
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots: Arc::default(),
            lock_dir: Some(lock_dir.into()),
        }
    }

    /// The directory holding project lock files, if any.
    #[must_use]
    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    /// Claims `project_name` for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns `PrintlineError::Concurrency` naming the holder when the
    /// project is already claimed here or by another process, and `Io` when
    /// the lock file cannot be opened.
    pub fn claim(&self, project_name: &str, run_id: Uuid) -> Result<ActiveRunGuard, PrintlineError> {
        match self.slots.entry(project_name.to_string()) {
            Entry::Occupied(holder) => Err(PrintlineError::Concurrency {
                project_name: project_name.to_string(),
                active_run_id: *holder.get(),
            }),
            Entry::Vacant(slot) => {
                let lock = self
                    .lock_dir
                    .as_deref()
                    .map(|dir| ProjectLock::acquire(dir, project_name, run_id))
                    .transpose()?;
                slot.insert(run_id);
                debug!(project = project_name, run_id = %run_id, cross_process = lock.is_some(), "project claimed");
                Ok(ActiveRunGuard {
                    slots: Arc::clone(&self.slots),
                    project_name: project_name.to_string(),
                    run_id,
                    _lock: lock,
                })
            }
        }
    }

    /// The run currently holding `project_name` in this process.
    #[must_use]
    pub fn holder(&self, project_name: &str) -> Option<Uuid> {
        self.slots.get(project_name).map(|r| *r.value())
    }

    /// Number of projects claimed by this process.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no project is claimed by this process.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// File name for a project's lock; anything outside `[A-Za-z0-9._-]`
/// becomes `_`.
fn lock_file_name(project_name: &str) -> String {
    let stem: String = project_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.lock")
}

/// An exclusive advisory lock on a project's lock file. The file holds the
/// run id of the holder while locked.
#[derive(Debug)]
struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    fn acquire(dir: &Path, project_name: &str, run_id: Uuid) -> Result<Self, PrintlineError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(lock_file_name(project_name));
        // Not truncated before locking: the holder's run id must survive.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() != fs2::lock_contended_error().raw_os_error() {
                return Err(e.into());
            }
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            return Err(PrintlineError::Concurrency {
                project_name: project_name.to_string(),
                active_run_id: Uuid::parse_str(holder.trim()).unwrap_or_else(|_| Uuid::nil()),
            });
        }

        file.set_len(0)?;
        write!(file, "{run_id}")?;
        file.flush()?;
        Ok(Self { file, path })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "failed to clear project lock");
        }
        // Closing the file releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Releases a project claim when dropped.
#[derive(Debug)]
pub struct ActiveRunGuard {
    slots: Arc<DashMap<String, Uuid>>,
    project_name: String,
    run_id: Uuid,
    _lock: Option<ProjectLock>,
}

impl ActiveRunGuard {
    /// The claimed project.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// The run holding the claim.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        // Only release our own claim.
        self.slots
            .remove_if(&self.project_name, |_, holder| *holder == self.run_id);
        debug!(project = %self.project_name, run_id = %self.run_id, "project released");
    }
}
