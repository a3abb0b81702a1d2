//! Run state and step result models.
//!
//! `RunState` is owned exclusively by the executor's drive loop for the
//! duration of a run; persisted snapshots are read-only copies held by the
//! checkpoint store. `StepResult` rows are created once and never mutated
//! after they are written into the result map.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet executing.
    Pending,
    /// The drive loop is dispatching steps.
    Running,
    /// New dispatch suspended; in-flight steps were allowed to finish.
    Paused,
    /// Every step reached a terminal result and none forced a failure.
    Completed,
    /// The run stopped on an aborting failure; resumable once the cause is
    /// addressed.
    Failed,
    /// Cancelled by the operator; not resumable.
    Cancelled,
}

impl RunStatus {
    /// True once the run can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// True when an operator may resume a run in this status. `Running`
    /// counts because a crashed process leaves its last checkpoint in that
    /// state.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Failed)
    }
}

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step executed and produced output bindings.
    Succeeded,
    /// Step reached a terminal failure after its policy was applied.
    Failed,
    /// Step did not run (blocked dependency, skip policy, or cancellation).
    Skipped,
}

/// Immutable record of one step's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// Step identifier this result belongs to.
    pub step_id: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Named output bindings visible to dependent steps.
    #[serde(default)]
    pub output: JsonMap<String, JsonValue>,
    /// Tokens the handler reported consuming.
    #[serde(default)]
    pub tokens_used: u64,
    /// Wall-clock duration of the final attempt, in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Number of handler invocations (0 for skipped/substituted results).
    #[serde(default)]
    pub attempts: u32,
    /// Error detail for failed (or skipped-due-to-failure) steps.
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    /// True when dependents may consume this result's outputs.
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Build a skipped result carrying the reason it did not run.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: JsonMap::new(),
            tokens_used: 0,
            duration_ms: 0,
            attempts: 0,
            error: Some(reason.into()),
        }
    }
}

/// Mutable state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    /// Unique run identifier.
    pub run_id: String,
    /// Identifier of the pipeline definition being executed.
    pub pipeline_id: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Resolved run inputs, carried so snapshots are self-contained.
    #[serde(default)]
    pub inputs: JsonMap<String, JsonValue>,
    /// Terminal results keyed by step identifier, in completion order.
    #[serde(default)]
    pub results: IndexMap<String, StepResult>,
    /// Total tokens consumed across all steps so far.
    #[serde(default)]
    pub tokens_used: u64,
    /// When the run entered `Running`.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Run-level error detail for failed runs.
    #[serde(default)]
    pub error: Option<String>,
}

impl RunState {
    /// Create a pending run for the given pipeline and inputs.
    pub fn new(run_id: impl Into<String>, pipeline_id: impl Into<String>, inputs: JsonMap<String, JsonValue>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Pending,
            inputs,
            results: IndexMap::new(),
            tokens_used: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Number of steps with a terminal result.
    pub fn completed_steps(&self) -> usize {
        self.results.len()
    }

    /// Record a terminal step result and its token usage. Existing results
    /// are never overwritten; the first terminal result for a step wins.
    pub fn record_result(&mut self, result: StepResult) {
        if self.results.contains_key(&result.step_id) {
            return;
        }
        self.tokens_used += result.tokens_used;
        self.results.insert(result.step_id.clone(), result);
    }
}
