//! Persistence for run records.

use crate::core::PipelineRun;
use crate::errors::PrintlineError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Storage backend for [`PipelineRun`] records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts or replaces a run record.
    async fn save(&self, run: &PipelineRun) -> Result<(), PrintlineError>;

    /// Loads a run record.
    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PrintlineError>;

    /// Lists every stored run, oldest first.
    async fn list(&self) -> Result<Vec<PipelineRun>, PrintlineError>;
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, PipelineRun>,
}

impl InMemoryRunStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), PrintlineError> {
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PrintlineError> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, PrintlineError> {
        let mut runs: Vec<PipelineRun> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

/// Stores each run as `<dir>/runs/<run_id>.json`.
///
/// Writes go to a temporary file that is renamed over the record, so a
/// reader never sees a partial document.
#[derive(Debug, Clone)]
pub struct JsonFileRunStore {
    dir: PathBuf,
}

impl JsonFileRunStore {
    /// Creates a store rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("runs"),
        }
    }

    /// Directory holding the run records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl RunStore for JsonFileRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<(), PrintlineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(run)?;
        let target = self.path_for(run.run_id);
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PrintlineError> {
        match tokio::fs::read(self.path_for(run_id)).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, PrintlineError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PipelineRun>(&body) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, StepStatus};
    use pretty_assertions::assert_eq;

    fn finished_run(project: &str) -> PipelineRun {
        let mut run = PipelineRun::new(project);
        run.transition(RunStatus::Running).unwrap();
        let step = run.push_step("decimate");
        step.start().unwrap();
        step.begin_attempt().unwrap();
        step.succeed([("decimated_mesh".to_string(), "/m/owl.stl".to_string())].into())
            .unwrap();
        run.transition(RunStatus::Succeeded).unwrap();
        run
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryRunStore::new();
        let run = finished_run("owl");
        store.save(&run).await.unwrap();

        assert_eq!(store.load(run.run_id).await.unwrap(), Some(run));
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRunStore::new(dir.path());
        let run = finished_run("owl");
        store.save(&run).await.unwrap();

        let loaded = store.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.steps, run.steps);
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(loaded.steps[0].status, StepStatus::Succeeded);
        assert_eq!(loaded.steps[0].output_refs["decimated_mesh"], "/m/owl.stl");
        assert!(store.dir().join(format!("{}.json", run.run_id)).exists());
    }

    #[tokio::test]
    async fn test_json_file_list_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRunStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        let first = finished_run("owl");
        let second = finished_run("fox");
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        std::fs::write(store.dir().join("broken.json"), "{").unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.project_name)
            .collect();
        assert_eq!(names, vec!["owl", "fox"]);
    }

    #[tokio::test]
    async fn test_save_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRunStore::new(dir.path());
        let mut run = PipelineRun::new("owl");
        store.save(&run).await.unwrap();
        run.transition(RunStatus::Aborted).unwrap();
        store.save(&run).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(
            store.load(run.run_id).await.unwrap().map(|r| r.status),
            Some(RunStatus::Aborted)
        );
    }
}
