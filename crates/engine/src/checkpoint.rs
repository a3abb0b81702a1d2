//! Durable, resumable run snapshots.
//!
//! The store is append-only: `save` adds a row and never deletes prior
//! checkpoints, enabling forensic replay. Writes are synchronous with
//! respect to step completion — a step's outcome is not considered durable
//! until its checkpoint write returns — which is what makes resume safe.
//! Store failures are fatal to the run; no failure policy can mask them.
//!
//! Two backends ship with the engine: an in-memory store for tests and
//! previews, and a file store writing one JSON-lines journal per run.
//! Networked stores are external collaborators implementing the same trait.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use loom_types::{Checkpoint, EngineError, RunStatus, RunSummary};

/// Persistence seam for run snapshots.
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint row.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;

    /// Latest checkpoint for a run, or `None` if the run is unknown.
    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, EngineError>;

    /// Summaries of runs whose latest status matches the filter, most
    /// recently updated first.
    fn list_resumable(&self, statuses: &[RunStatus]) -> Result<Vec<RunSummary>, EngineError>;
}

/// In-memory append-only store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    rows: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all runs (append-only, so this only grows).
    pub fn row_count(&self) -> usize {
        self.rows.lock().expect("checkpoint lock").len()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.rows.lock().expect("checkpoint lock").push(checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        let rows = self.rows.lock().expect("checkpoint lock");
        Ok(rows.iter().rev().find(|row| row.run_id == run_id).cloned())
    }

    fn list_resumable(&self, statuses: &[RunStatus]) -> Result<Vec<RunSummary>, EngineError> {
        let rows = self.rows.lock().expect("checkpoint lock");
        let mut latest: indexmap::IndexMap<&str, &Checkpoint> = indexmap::IndexMap::new();
        for row in rows.iter() {
            latest.insert(row.run_id.as_str(), row);
        }

        let mut summaries: Vec<RunSummary> = latest
            .values()
            .filter(|row| statuses.contains(&row.state.status))
            .map(|row| RunSummary::from_checkpoint(row))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// File-backed store: one append-only JSON-lines journal per run.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| EngineError::Checkpoint(format!("create store dir: {err}")))?;
        Ok(Self { root })
    }

    fn journal_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{run_id}.jsonl"))
    }

    fn read_latest(path: &Path) -> Result<Option<Checkpoint>, EngineError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(EngineError::Checkpoint(format!("read journal: {err}"))),
        };

        let Some(last_line) = content.lines().rev().find(|line| !line.trim().is_empty()) else {
            return Ok(None);
        };
        serde_json::from_str(last_line)
            .map(Some)
            .map_err(|err| EngineError::Checkpoint(format!("decode checkpoint row: {err}")))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let mut row = serde_json::to_string(checkpoint).map_err(|err| EngineError::Checkpoint(format!("encode checkpoint: {err}")))?;
        row.push('\n');

        let path = self.journal_path(&checkpoint.run_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| EngineError::Checkpoint(format!("open journal: {err}")))?;
        file.write_all(row.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|err| EngineError::Checkpoint(format!("append journal: {err}")))?;

        debug!(run_id = %checkpoint.run_id, step_id = %checkpoint.step_id, "checkpoint persisted");
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        Self::read_latest(&self.journal_path(run_id))
    }

    fn list_resumable(&self, statuses: &[RunStatus]) -> Result<Vec<RunSummary>, EngineError> {
        let entries = fs::read_dir(&self.root).map_err(|err| EngineError::Checkpoint(format!("read store dir: {err}")))?;

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| EngineError::Checkpoint(format!("read store dir: {err}")))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            match Self::read_latest(&path) {
                Ok(Some(checkpoint)) => {
                    if statuses.contains(&checkpoint.state.status) {
                        summaries.push(RunSummary::from_checkpoint(&checkpoint));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // One corrupt journal must not hide every other run.
                    warn!(path = %path.display(), %err, "skipping unreadable checkpoint journal");
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{PipelineDefinition, RunState, StepResult};
    use serde_json::Map as JsonMap;

    fn definition() -> PipelineDefinition {
        serde_yaml::from_str(
            r#"
pipeline: demo
steps:
  - id: plan
    handler: generate
  - id: build
    handler: generate
    depends_on: [plan]
"#,
        )
        .expect("definition")
    }

    fn checkpoint_after(run_id: &str, step_id: &str, status: RunStatus) -> Checkpoint {
        let mut state = RunState::new(run_id, "demo", JsonMap::new());
        state.status = status;
        state.record_result(StepResult {
            step_id: step_id.to_string(),
            status: loom_types::StepStatus::Succeeded,
            output: JsonMap::new(),
            tokens_used: 10,
            duration_ms: 3,
            attempts: 1,
            error: None,
        });
        Checkpoint::new(step_id, state, definition())
    }

    #[test]
    fn memory_store_returns_latest_row() {
        let store = MemoryCheckpointStore::new();
        store.save(&checkpoint_after("run-1", "plan", RunStatus::Running)).expect("save");
        store.save(&checkpoint_after("run-1", "build", RunStatus::Completed)).expect("save");

        let latest = store.load_latest("run-1").expect("load").expect("checkpoint");
        assert_eq!(latest.step_id, "build");
        assert_eq!(store.row_count(), 2);
        assert!(store.load_latest("run-2").expect("load").is_none());
    }

    #[test]
    fn file_store_round_trips_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).expect("open");

        store.save(&checkpoint_after("run-1", "plan", RunStatus::Running)).expect("save");
        store.save(&checkpoint_after("run-1", "build", RunStatus::Failed)).expect("save");

        let latest = store.load_latest("run-1").expect("load").expect("checkpoint");
        assert_eq!(latest.step_id, "build");
        assert_eq!(latest.state.status, RunStatus::Failed);

        // Both rows remain in the journal.
        let journal = std::fs::read_to_string(dir.path().join("run-1.jsonl")).expect("journal");
        assert_eq!(journal.lines().count(), 2);
    }

    #[test]
    fn list_resumable_filters_by_latest_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).expect("open");

        store.save(&checkpoint_after("run-done", "build", RunStatus::Completed)).expect("save");
        store.save(&checkpoint_after("run-failed", "plan", RunStatus::Failed)).expect("save");
        store.save(&checkpoint_after("run-paused", "plan", RunStatus::Paused)).expect("save");

        let resumable = store
            .list_resumable(&[RunStatus::Running, RunStatus::Paused, RunStatus::Failed])
            .expect("list");
        let ids: Vec<&str> = resumable.iter().map(|s| s.run_id.as_str()).collect();

        assert_eq!(resumable.len(), 2);
        assert!(ids.contains(&"run-failed"));
        assert!(ids.contains(&"run-paused"));
        assert!(!ids.contains(&"run-done"));
        assert!(resumable.iter().all(|s| s.steps_total == 2));
    }

    #[test]
    fn superseded_rows_do_not_resurface() {
        let store = MemoryCheckpointStore::new();
        store.save(&checkpoint_after("run-1", "plan", RunStatus::Failed)).expect("save");
        store.save(&checkpoint_after("run-1", "build", RunStatus::Completed)).expect("save");

        let resumable = store.list_resumable(&[RunStatus::Failed]).expect("list");
        assert!(resumable.is_empty());
    }
}
