//! Structured lifecycle events emitted by the engine.
//!
//! Consumers (logging, metrics, dashboards) receive these over a channel
//! owned by whoever started the run; the engine never blocks on a slow
//! consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetScope, BudgetTier};
use crate::run::{RunStatus, StepStatus};

/// Lifecycle event for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run entered the `Running` status.
    RunStarted {
        /// Run identifier.
        run_id: String,
        /// Emission timestamp.
        at: DateTime<Utc>,
    },
    /// The run moved to a new status (paused, resumed, cancel requested).
    RunStatusChanged {
        /// Run identifier.
        run_id: String,
        /// Status after the transition.
        status: RunStatus,
        /// Optional operator-facing detail.
        message: Option<String>,
    },
    /// The run reached a terminal status.
    RunCompleted {
        /// Run identifier.
        run_id: String,
        /// Terminal status.
        status: RunStatus,
        /// Emission timestamp.
        finished_at: DateTime<Utc>,
        /// Run-level error detail, if any.
        error: Option<String>,
    },
    /// A step attempt was handed to its handler.
    StepStarted {
        /// Run identifier.
        run_id: String,
        /// Step identifier.
        step_id: String,
        /// 1-based attempt counter.
        attempt: u32,
        /// Emission timestamp.
        at: DateTime<Utc>,
    },
    /// A step reached a terminal result.
    StepFinished {
        /// Run identifier.
        run_id: String,
        /// Step identifier.
        step_id: String,
        /// Terminal step status.
        status: StepStatus,
        /// Tokens the handler reported consuming.
        tokens_used: u64,
        /// Duration of the final attempt in milliseconds.
        duration_ms: u64,
        /// Handler invocations performed.
        attempts: u32,
        /// Error detail, if any.
        error: Option<String>,
    },
    /// A failed attempt will be re-dispatched.
    StepRetried {
        /// Run identifier.
        run_id: String,
        /// Step identifier.
        step_id: String,
        /// Attempt number about to run.
        attempt: u32,
        /// Failure that triggered the retry.
        reason: String,
    },
    /// A budget scope crossed into a new tier.
    BudgetTierChanged {
        /// Run identifier.
        run_id: String,
        /// Scope whose tier changed.
        scope: BudgetScope,
        /// Tier after the transition.
        tier: BudgetTier,
    },
    /// A provider pool backed off after a throttle signal.
    ProviderThrottled {
        /// Provider tag.
        provider: String,
        /// Permitted concurrency after the adjustment.
        permitted: usize,
    },
    /// A provider pool recovered capacity after sustained successes.
    ProviderRecovered {
        /// Provider tag.
        provider: String,
        /// Permitted concurrency after the adjustment.
        permitted: usize,
    },
    /// A checkpoint write completed.
    CheckpointSaved {
        /// Run identifier.
        run_id: String,
        /// Step whose completion was persisted.
        step_id: String,
        /// Emission timestamp.
        at: DateTime<Utc>,
    },
}
