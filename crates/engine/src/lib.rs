//! # Loom Engine
//!
//! Loom executes declaratively defined pipelines of generative-text steps
//! under per-step and per-run token budgets, per-provider concurrency and
//! rate limits, and mid-run failure recovery via checkpointing.
//!
//! ## Key features
//!
//! - **Dependency-graph scheduling**: steps are validated into an acyclic
//!   graph and dispatched wave by wave, independent steps concurrently
//! - **Budget-aware dispatch**: a ledger gates every step against its
//!   agent-scope and run-scope allocations, with a pluggable degradation
//!   strategy under pressure
//! - **Adaptive provider throttling**: per-provider permit pools back off
//!   on throttle signals and recover after sustained successes
//! - **Exactly-once resumption**: every step completion is checkpointed
//!   before it is treated as durable; resume never re-invokes a persisted
//!   step
//!
//! ## Architecture
//!
//! - **`resolve`**: `${{ ... }}` binding resolution against run inputs and
//!   prior step outputs
//! - **`graph`**: definition validation and deterministic wave computation
//! - **`ledger`**: budget reservations, consumption, and status tiers
//! - **`governor`**: per-provider admission control with adaptive limits
//! - **`checkpoint`**: append-only snapshot stores (memory and file)
//! - **`dispatcher`**: single-attempt execution against the shared services
//! - **`executor`**: the drive loop owning run state, controls, and events
//! - **`orchestrator`**: the thin operator command set over runs
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use loom_engine::{
//!     ExecutorConfig, HandlerOutput, HandlerRegistry, MemoryCheckpointStore, StepHandler,
//!     StepInvocation, WorkflowExecutor, parse_pipeline_str,
//! };
//! use loom_types::StepFailure;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl StepHandler for Echo {
//!     async fn invoke(&self, invocation: StepInvocation) -> Result<HandlerOutput, StepFailure> {
//!         Ok(HandlerOutput { outputs: invocation.inputs, tokens_used: 1 })
//!     }
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let definition = parse_pipeline_str(r#"
//! pipeline: demo
//! steps:
//!   - id: greet
//!     handler: echo
//!     with:
//!       text: "hello"
//! "#)?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("echo", Arc::new(Echo));
//! let executor = WorkflowExecutor::new(
//!     Arc::new(registry),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     ExecutorConfig::default(),
//! );
//!
//! let (_control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
//! let (event_tx, _event_rx) = tokio::sync::mpsc::unbounded_channel();
//! let state = executor.start(definition, Default::default(), control_rx, event_tx).await?;
//! assert!(state.results["greet"].succeeded());
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod checkpoint;
pub mod dispatcher;
pub mod executor;
pub mod governor;
pub mod graph;
pub mod ledger;
pub mod orchestrator;
pub mod resolve;

// Re-export commonly used types for convenience.
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use dispatcher::{
    DispatchFailure, DispatchResult, DispatchSuccess, HandlerOutput, HandlerRegistry, StepDispatcher, StepHandler,
    StepInvocation,
};
pub use executor::{ExecutorConfig, RunControl, WorkflowExecutor, generate_run_id};
pub use governor::{
    ConcurrencyGovernor, GovernorConfig, GovernorPermit, LimitChange, LimitChangeKind, LocalRateWindow, PoolSnapshot,
    ProviderOutcome, RateWindowBackend,
};
pub use graph::ExecutionGraph;
pub use ledger::{BudgetLedger, BudgetStrategy, PassthroughStrategy};
pub use orchestrator::{Orchestrator, StartedRun};
pub use resolve::{RunContext, interpolate_value, resolve_bindings};

/// Load a pipeline definition from a YAML (or JSON) document string.
///
/// Structural validation beyond syntax — unique identifiers, resolvable
/// dependencies, acyclicity — happens when the definition is started;
/// callers wanting early rejection can build an
/// [`ExecutionGraph`](graph::ExecutionGraph) themselves.
pub fn parse_pipeline_str(content: &str) -> Result<loom_types::PipelineDefinition> {
    serde_yaml::from_str(content).context("failed to parse pipeline document")
}

/// Load a pipeline definition from a file.
pub fn parse_pipeline_file(file_path: impl AsRef<Path>) -> Result<loom_types::PipelineDefinition> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("failed to read pipeline file: {}", file_path.display()))?;
    parse_pipeline_str(&content).with_context(|| format!("invalid pipeline document: {}", file_path.display()))
}
