//! Checkpoint rows and resumable-run summaries.
//!
//! A checkpoint is taken after every step completion (success or terminal
//! failure) and never mutated after creation. The pipeline definition rides
//! along with the state snapshot so resuming a run needs no external
//! definition registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineDefinition;
use crate::run::{RunState, RunStatus};

/// Durable snapshot of a run taken at a step boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Run the snapshot belongs to.
    pub run_id: String,
    /// Step whose completion triggered the snapshot.
    pub step_id: String,
    /// Read-only copy of the run state at the snapshot point.
    pub state: RunState,
    /// Definition the run was started from.
    pub definition: PipelineDefinition,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot the given state at a step boundary.
    pub fn new(step_id: impl Into<String>, state: RunState, definition: PipelineDefinition) -> Self {
        Self {
            run_id: state.run_id.clone(),
            step_id: step_id.into(),
            state,
            definition,
            created_at: Utc::now(),
        }
    }
}

/// Operator-facing summary of a persisted run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline the run executes.
    pub pipeline_id: String,
    /// Status captured by the latest checkpoint.
    pub status: RunStatus,
    /// Steps with a terminal result.
    pub steps_completed: usize,
    /// Total steps in the definition.
    pub steps_total: usize,
    /// Timestamp of the latest checkpoint.
    pub updated_at: DateTime<Utc>,
}

impl RunSummary {
    /// Summarize the latest checkpoint of a run.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            pipeline_id: checkpoint.state.pipeline_id.clone(),
            status: checkpoint.state.status,
            steps_completed: checkpoint.state.completed_steps(),
            steps_total: checkpoint.definition.steps.len(),
            updated_at: checkpoint.created_at,
        }
    }
}
