//! Engine error taxonomy.
//!
//! `StepFailure` is the normalized failure a handler (or the dispatcher on
//! its behalf) reports for one step attempt; it is resolved by the step's
//! failure policy. `EngineError` covers run-level failures: graph
//! validation and checkpoint I/O errors are always fatal and no policy can
//! mask them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::BudgetScope;

/// Normalized failure for a single step attempt.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFailure {
    /// The step (or its permit acquisition) exceeded its time bound.
    #[error("step timed out")]
    Timeout,
    /// The provider reported it is rate-limiting; drives governor backoff.
    #[error("provider throttled the request")]
    Throttled,
    /// Handler-reported failure unrelated to budget or timeout.
    #[error("provider error: {detail}")]
    Provider {
        /// Handler-supplied detail.
        detail: String,
    },
    /// Input bindings could not be resolved for this step.
    #[error("validation error: {detail}")]
    Validation {
        /// What failed to resolve.
        detail: String,
    },
    /// The budget ledger denied the step's reservation.
    #[error("budget denied for {scope}")]
    BudgetDenied {
        /// Scope that refused the reservation.
        scope: BudgetScope,
    },
}

impl StepFailure {
    /// Convenience constructor for handler-reported failures.
    pub fn provider(detail: impl Into<String>) -> Self {
        Self::Provider { detail: detail.into() }
    }

    /// Convenience constructor for binding/validation failures.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation { detail: detail.into() }
    }

    /// True when retrying the same attempt could plausibly succeed.
    /// Validation failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }
}

/// Run-level errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural problem in the pipeline definition (duplicate ids,
    /// dangling dependency, cycle) or a missing required input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A run-level time bound elapsed.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The ledger denied a request and the owning step's policy aborts.
    #[error("budget exceeded for {scope}")]
    BudgetExceeded {
        /// Scope that was exhausted.
        scope: BudgetScope,
    },
    /// A step exhausted its retry ceiling.
    #[error("step '{step}' exhausted {attempts} attempts")]
    MaxRetriesExceeded {
        /// Step identifier.
        step: String,
        /// Attempts performed.
        attempts: u32,
    },
    /// Checkpoint store failure; always fatal to the run.
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),
    /// No checkpoint exists for the requested run.
    #[error("run '{0}' not found")]
    RunNotFound(String),
    /// The run's status does not permit resuming.
    #[error("run '{0}' is not resumable")]
    NotResumable(String),
}
