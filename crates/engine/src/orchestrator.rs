//! Thin operator surface over active and persisted runs.
//!
//! The orchestrator owns the control channels of runs it started and
//! answers status queries from the checkpoint store. It is the in-process
//! command set an HTTP/CLI/RPC transport would call; the transports
//! themselves live outside the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use loom_types::{EngineError, PipelineDefinition, RunEvent, RunState, RunStatus, RunSummary};

use crate::checkpoint::CheckpointStore;
use crate::executor::{RunControl, WorkflowExecutor, generate_run_id};
use crate::graph::ExecutionGraph;

/// A run the orchestrator has launched and can still control.
struct ActiveRun {
    control: mpsc::UnboundedSender<RunControl>,
    join: JoinHandle<Result<RunState, EngineError>>,
}

/// Handle returned when a run is started or resumed.
pub struct StartedRun {
    /// Identifier for follow-up commands.
    pub run_id: String,
    /// Lifecycle events for this run; the caller owns the receiver.
    pub events: mpsc::UnboundedReceiver<RunEvent>,
}

/// Operator command set: start, resume, pause, cancel, status, and
/// resumable-run listing.
pub struct Orchestrator {
    executor: Arc<WorkflowExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl Orchestrator {
    /// Orchestrator over an executor and its checkpoint store.
    pub fn new(executor: Arc<WorkflowExecutor>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            executor,
            checkpoints,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and launch a run. Structural problems are rejected here,
    /// before any task is spawned. Must be called within a Tokio runtime.
    pub fn start(&self, definition: PipelineDefinition, inputs: JsonMap<String, Value>) -> Result<StartedRun> {
        ExecutionGraph::build(&definition)?;

        let run_id = generate_run_id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let executor = Arc::clone(&self.executor);
        let id = run_id.clone();
        let join = tokio::spawn(async move { executor.start_as(id, definition, inputs, control_rx, event_tx).await });

        info!(run_id, "run launched");
        self.track(run_id.clone(), control_tx, join);
        Ok(StartedRun { run_id, events: event_rx })
    }

    /// Resume a persisted run from its latest checkpoint.
    pub fn resume(&self, run_id: &str) -> Result<StartedRun> {
        let checkpoint = self
            .checkpoints
            .load_latest(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !checkpoint.state.status.is_resumable() {
            bail!(EngineError::NotResumable(run_id.to_string()));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let executor = Arc::clone(&self.executor);
        let id = run_id.to_string();
        let join = tokio::spawn(async move { executor.resume(&id, control_rx, event_tx).await });

        info!(run_id, "run resumed");
        self.track(run_id.to_string(), control_tx, join);
        Ok(StartedRun {
            run_id: run_id.to_string(),
            events: event_rx,
        })
    }

    /// Stop dispatching new steps; in-flight steps finish and checkpoint.
    pub fn pause(&self, run_id: &str) -> Result<()> {
        self.send(run_id, RunControl::Pause)
    }

    /// Cancel a run; in-flight handler calls drain to their own timeouts.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        self.send(run_id, RunControl::Cancel)
    }

    /// Wait for a launched run to finish and return its final state.
    pub async fn wait(&self, run_id: &str) -> Result<RunState> {
        let run = self
            .runs
            .lock()
            .expect("orchestrator lock")
            .remove(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let state = run.join.await.context("run task panicked")??;
        Ok(state)
    }

    /// Latest persisted summary for a run.
    pub fn status(&self, run_id: &str) -> Result<RunSummary> {
        let checkpoint = self
            .checkpoints
            .load_latest(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        Ok(RunSummary::from_checkpoint(&checkpoint))
    }

    /// Runs an operator could resume: running (crashed), paused, or failed.
    pub fn list_resumable(&self) -> Result<Vec<RunSummary>> {
        Ok(self
            .checkpoints
            .list_resumable(&[RunStatus::Running, RunStatus::Paused, RunStatus::Failed])?)
    }

    fn track(&self, run_id: String, control: mpsc::UnboundedSender<RunControl>, join: JoinHandle<Result<RunState, EngineError>>) {
        self.runs
            .lock()
            .expect("orchestrator lock")
            .insert(run_id, ActiveRun { control, join });
    }

    fn send(&self, run_id: &str, command: RunControl) -> Result<()> {
        let runs = self.runs.lock().expect("orchestrator lock");
        let run = runs
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        run.control
            .send(command)
            .map_err(|_| EngineError::NotResumable(run_id.to_string()))
            .context("run already finished")?;
        Ok(())
    }
}
