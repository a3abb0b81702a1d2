//! Workflow executor: drives a pipeline definition to a terminal run state
//! while emitting lifecycle events and responding to pause/cancel controls.
//!
//! The caller owns the event receiver and issues commands through the
//! control channel. Execution is topological-levelized: waves are computed
//! up front and the steps of one wave are dispatched concurrently, bounded
//! by the definition's `max_parallelism`. Worker completions return through
//! an internal result queue so only the drive loop ever mutates `RunState`
//! — a single-writer discipline that needs no lock around the state.
//!
//! A checkpoint is written after every step completion, before the result
//! is treated as durable; `resume` reloads the latest checkpoint and never
//! re-invokes a step whose result is already persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map as JsonMap, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use loom_types::{
    BudgetScope, BudgetTier, Checkpoint, EngineError, FailurePolicy, PipelineDefinition, RunEvent, RunState, RunStatus,
    StepFailure, StepResult, StepSpec, StepStatus,
};

use crate::checkpoint::CheckpointStore;
use crate::dispatcher::{DispatchResult, HandlerRegistry, StepDispatcher};
use crate::governor::{ConcurrencyGovernor, GovernorConfig, RateWindowBackend};
use crate::graph::ExecutionGraph;
use crate::ledger::{BudgetLedger, BudgetStrategy, PassthroughStrategy};
use crate::resolve::RunContext;

/// Operator commands accepted by a driving run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Stop dispatching new steps; in-flight steps finish and checkpoint.
    Pause,
    /// Resume dispatching after a pause.
    Resume,
    /// Stop dispatching, drain in-flight steps, mark the run cancelled.
    Cancel,
}

/// Engine tuning shared across runs.
pub struct ExecutorConfig {
    /// Governor tuning (base concurrency, backoff, recovery).
    pub governor: GovernorConfig,
    /// Optional shared request-rate backend for distributed deployments.
    pub rate_backend: Option<Arc<dyn RateWindowBackend>>,
    /// Budget degradation strategy consulted under pressure.
    pub strategy: Arc<dyn BudgetStrategy>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            rate_backend: None,
            strategy: Arc::new(PassthroughStrategy),
        }
    }
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique run identifier.
pub fn generate_run_id() -> String {
    let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{sequence:04}", Utc::now().format("%Y%m%d%H%M%S"))
}

/// Executes pipeline definitions against a handler registry, governor, and
/// checkpoint store.
pub struct WorkflowExecutor {
    registry: Arc<HandlerRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    governor: Arc<ConcurrencyGovernor>,
    strategy: Arc<dyn BudgetStrategy>,
}

impl WorkflowExecutor {
    /// Executor over the given registry and store.
    pub fn new(registry: Arc<HandlerRegistry>, checkpoints: Arc<dyn CheckpointStore>, config: ExecutorConfig) -> Self {
        let mut governor = ConcurrencyGovernor::new(config.governor);
        if let Some(backend) = config.rate_backend {
            governor = governor.with_rate_backend(backend);
        }
        Self {
            registry,
            checkpoints,
            governor: Arc::new(governor),
            strategy: config.strategy,
        }
    }

    /// Provider pools shared by every run on this executor.
    pub fn governor(&self) -> &Arc<ConcurrencyGovernor> {
        &self.governor
    }

    /// Start a new run with a generated identifier and drive it to a
    /// terminal (or paused) state.
    pub async fn start(
        &self,
        definition: PipelineDefinition,
        inputs: JsonMap<String, Value>,
        control_rx: mpsc::UnboundedReceiver<RunControl>,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<RunState, EngineError> {
        self.start_as(generate_run_id(), definition, inputs, control_rx, event_tx).await
    }

    /// Start a new run under a caller-chosen identifier.
    ///
    /// Rejects definitions with structural problems (duplicate identifiers,
    /// dangling dependencies, cycles, misconfigured substitution policies)
    /// and missing required inputs with a [`EngineError::Validation`].
    pub async fn start_as(
        &self,
        run_id: String,
        definition: PipelineDefinition,
        inputs: JsonMap<String, Value>,
        control_rx: mpsc::UnboundedReceiver<RunControl>,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<RunState, EngineError> {
        let graph = ExecutionGraph::build(&definition)?;
        validate_substitution_policies(&definition)?;
        let inputs = resolve_run_inputs(&definition, inputs)?;
        let state = RunState::new(run_id, definition.pipeline.clone(), inputs);
        self.drive(definition, graph, state, control_rx, event_tx).await
    }

    /// Resume a run from its latest checkpoint.
    ///
    /// Steps with a persisted result are never re-invoked; scheduling
    /// re-enters at the first step absent from the snapshot's result map.
    pub async fn resume(
        &self,
        run_id: &str,
        control_rx: mpsc::UnboundedReceiver<RunControl>,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<RunState, EngineError> {
        let checkpoint = self
            .checkpoints
            .load_latest(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !checkpoint.state.status.is_resumable() {
            return Err(EngineError::NotResumable(run_id.to_string()));
        }

        let definition = checkpoint.definition;
        let graph = ExecutionGraph::build(&definition)?;
        let mut state = checkpoint.state;
        state.error = None;
        state.finished_at = None;
        // Succeeded results are never re-invoked; failed and skipped
        // results are superseded so their steps re-dispatch now that the
        // underlying cause can have been addressed.
        state.results.retain(|_, result| result.succeeded());
        info!(run_id, completed = state.completed_steps(), "resuming run from checkpoint");
        self.drive(definition, graph, state, control_rx, event_tx).await
    }

    async fn drive(
        &self,
        definition: PipelineDefinition,
        graph: ExecutionGraph,
        mut state: RunState,
        control_rx: mpsc::UnboundedReceiver<RunControl>,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<RunState, EngineError> {
        let ledger = Arc::new(BudgetLedger::for_pipeline(&definition));
        replay_consumption(&ledger, &definition, &state);

        let dispatcher = Arc::new(StepDispatcher::new(
            state.run_id.clone(),
            Arc::clone(&self.governor),
            Arc::clone(&ledger),
            Arc::clone(&self.registry),
            Arc::clone(&self.strategy),
            definition.defaults,
            event_tx.clone(),
        ));

        state.status = RunStatus::Running;
        let _ = event_tx.send(RunEvent::RunStarted {
            run_id: state.run_id.clone(),
            at: Utc::now(),
        });

        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + definition.run_timeout();

        let drive = DriveLoop {
            definition,
            graph,
            checkpoints: Arc::clone(&self.checkpoints),
            dispatcher,
            ledger,
            state,
            event_tx,
            control_rx,
            control_closed: false,
            cancel_tx,
            done_tx,
            done_rx,
            paused: false,
            cancel_requested: false,
            abort: None,
            deadline,
            tiers: HashMap::new(),
        };
        drive.run().await
    }
}

/// Completion notice a worker sends back to the drive loop.
struct WorkerDone {
    step_id: String,
    attempt: u32,
    result: DispatchResult,
}

/// Owns `RunState` for the duration of one run; the only writer.
struct DriveLoop {
    definition: PipelineDefinition,
    graph: ExecutionGraph,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: Arc<StepDispatcher>,
    ledger: Arc<BudgetLedger>,
    state: RunState,
    event_tx: mpsc::UnboundedSender<RunEvent>,
    control_rx: mpsc::UnboundedReceiver<RunControl>,
    control_closed: bool,
    cancel_tx: watch::Sender<bool>,
    done_tx: mpsc::UnboundedSender<WorkerDone>,
    done_rx: mpsc::UnboundedReceiver<WorkerDone>,
    paused: bool,
    cancel_requested: bool,
    abort: Option<String>,
    deadline: Instant,
    tiers: HashMap<BudgetScope, BudgetTier>,
}

impl DriveLoop {
    async fn run(mut self) -> Result<RunState, EngineError> {
        self.emit_status(RunStatus::Running, None);

        let waves: Vec<Vec<String>> = self.graph.waves().to_vec();
        'waves: for wave in &waves {
            if self.paused && !self.cancel_requested {
                self.wait_while_paused().await?;
                if self.paused {
                    return self.finalize_paused();
                }
            }

            let mut queue: VecDeque<String> = wave
                .iter()
                .filter(|id| !self.state.results.contains_key(*id))
                .cloned()
                .collect();
            let mut active: usize = 0;

            while !queue.is_empty() || active > 0 {
                self.drain_controls();
                self.check_deadline();
                if self.abort.is_some() || self.cancel_requested {
                    queue.clear();
                }

                if !self.paused {
                    while active < self.definition.max_parallelism
                        && let Some(step_id) = queue.pop_front()
                    {
                        if self.prepare_dispatch(&step_id)? {
                            active += 1;
                        }
                    }
                }

                if active == 0 {
                    if self.paused && !queue.is_empty() && !self.cancel_requested {
                        self.wait_while_paused().await?;
                        if self.paused {
                            return self.finalize_paused();
                        }
                        continue;
                    }
                    break;
                }

                tokio::select! {
                    maybe_done = self.done_rx.recv() => {
                        if let Some(done) = maybe_done {
                            active -= 1;
                            if self.handle_completion(done)? {
                                active += 1;
                            }
                        }
                    }
                    maybe_command = self.control_rx.recv(), if !self.control_closed => {
                        match maybe_command {
                            Some(command) => self.apply_control(command),
                            None => self.control_closed = true,
                        }
                    }
                }
            }

            if self.abort.is_some() || self.cancel_requested {
                break 'waves;
            }
        }

        self.finalize()
    }

    /// Dispatch one step, or record a skipped result when a dependency
    /// blocks it. Returns whether a worker was spawned.
    fn prepare_dispatch(&mut self, step_id: &str) -> Result<bool, EngineError> {
        let step = self
            .definition
            .step(step_id)
            .expect("scheduled step exists in definition")
            .clone();

        if let Some(reason) = self.dependency_block(&step) {
            debug!(run_id = %self.state.run_id, step_id, %reason, "step blocked by dependency");
            self.complete_step(&step, StepResult::skipped(step_id, reason))?;
            return Ok(false);
        }

        self.spawn_attempt(&step, 1, None);
        Ok(true)
    }

    /// A dependent runs only when every dependency succeeded, or was
    /// skipped and this step tolerates skipped predecessors.
    fn dependency_block(&self, step: &StepSpec) -> Option<String> {
        for dependency in &step.depends_on {
            match self.state.results.get(dependency) {
                Some(result) if result.succeeded() => continue,
                Some(result) if result.status == StepStatus::Skipped && step.allow_skipped_deps => continue,
                Some(result) => {
                    let detail = match result.status {
                        StepStatus::Failed => "failed earlier in the run",
                        _ => "did not execute successfully",
                    };
                    return Some(format!("dependency '{dependency}' {detail}"));
                }
                None => return Some(format!("dependency '{dependency}' has no recorded result")),
            }
        }
        None
    }

    fn spawn_attempt(&self, step: &StepSpec, attempt: u32, feedback: Option<String>) {
        let context = RunContext {
            inputs: self.state.inputs.clone(),
            steps: self.successful_outputs(),
            attempt,
            feedback,
        };
        let specification = step.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let done_tx = self.done_tx.clone();
        let cancel = self.cancel_tx.subscribe();

        let _ = self.event_tx.send(RunEvent::StepStarted {
            run_id: self.state.run_id.clone(),
            step_id: step.id.clone(),
            attempt,
            at: Utc::now(),
        });
        debug!(run_id = %self.state.run_id, step_id = %step.id, attempt, "dispatching step");

        tokio::spawn(async move {
            let result = dispatcher.dispatch(&specification, &context, cancel).await;
            let _ = done_tx.send(WorkerDone {
                step_id: specification.id,
                attempt,
                result,
            });
        });
    }

    /// Apply the step's failure policy to a completed attempt. Returns
    /// `true` when a retry was respawned (the worker slot stays busy).
    fn handle_completion(&mut self, done: WorkerDone) -> Result<bool, EngineError> {
        let step = self
            .definition
            .step(&done.step_id)
            .expect("completed step exists in definition")
            .clone();

        let attempt = done.attempt;
        let failed = match done.result {
            Ok(success) => {
                self.complete_step(
                    &step,
                    StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Succeeded,
                        output: success.outputs,
                        tokens_used: success.tokens_used,
                        duration_ms: success.duration_ms,
                        attempts: attempt,
                        error: None,
                    },
                )?;
                return Ok(false);
            }
            Err(failed) => failed,
        };

        let policy = step.failure_policy(&self.definition.defaults);
        let retry_limit = step.retry_limit(&self.definition.defaults);
        match policy {
            FailurePolicy::Retry
                if failed.failure.is_retryable()
                    && attempt < retry_limit
                    && !self.cancel_requested
                    && self.abort.is_none() =>
            {
                let next_attempt = attempt + 1;
                let reason = failed.failure.to_string();
                let _ = self.event_tx.send(RunEvent::StepRetried {
                    run_id: self.state.run_id.clone(),
                    step_id: step.id.clone(),
                    attempt: next_attempt,
                    reason: reason.clone(),
                });
                warn!(run_id = %self.state.run_id, step_id = %step.id, attempt = next_attempt, %reason, "retrying step");
                self.spawn_attempt(&step, next_attempt, Some(reason));
                Ok(true)
            }
            FailurePolicy::Retry => {
                let error = if failed.failure.is_retryable() {
                    EngineError::MaxRetriesExceeded {
                        step: step.id.clone(),
                        attempts: attempt,
                    }
                    .to_string()
                } else {
                    failed.failure.to_string()
                };
                self.record_failed(&step, attempt, failed.duration_ms, error.clone())?;
                self.abort = Some(error);
                Ok(false)
            }
            FailurePolicy::Abort => {
                let error = abort_detail(&failed.failure);
                self.record_failed(&step, attempt, failed.duration_ms, error.clone())?;
                self.abort = Some(error);
                Ok(false)
            }
            FailurePolicy::Skip => {
                self.complete_step(
                    &step,
                    StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Skipped,
                        output: JsonMap::new(),
                        tokens_used: 0,
                        duration_ms: failed.duration_ms,
                        attempts: attempt,
                        error: Some(failed.failure.to_string()),
                    },
                )?;
                Ok(false)
            }
            FailurePolicy::Fallback => {
                debug!(run_id = %self.state.run_id, step_id = %step.id, "substituting fallback output");
                self.substitute_output(&step, attempt, failed.duration_ms, step.fallback.clone())?;
                Ok(false)
            }
            FailurePolicy::ContinueWithDefault => {
                debug!(run_id = %self.state.run_id, step_id = %step.id, "substituting default output");
                self.substitute_output(&step, attempt, failed.duration_ms, step.default_output.clone())?;
                Ok(false)
            }
        }
    }

    fn record_failed(&mut self, step: &StepSpec, attempts: u32, duration_ms: u64, error: String) -> Result<(), EngineError> {
        self.complete_step(
            step,
            StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output: JsonMap::new(),
                tokens_used: 0,
                duration_ms,
                attempts,
                error: Some(error),
            },
        )
    }

    /// Record a substituted (fallback or default) result without invoking
    /// the handler again. The output object was validated at start.
    fn substitute_output(&mut self, step: &StepSpec, attempts: u32, duration_ms: u64, output: Option<Value>) -> Result<(), EngineError> {
        let outputs = match output {
            Some(Value::Object(map)) => map,
            _ => JsonMap::new(),
        };
        self.complete_step(
            step,
            StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Succeeded,
                output: outputs,
                tokens_used: 0,
                duration_ms,
                attempts,
                error: None,
            },
        )
    }

    /// Record a terminal result, persist it, then announce it. The
    /// checkpoint write happens before the completion event so a result is
    /// never observable without being durable.
    fn complete_step(&mut self, step: &StepSpec, result: StepResult) -> Result<(), EngineError> {
        let finished = RunEvent::StepFinished {
            run_id: self.state.run_id.clone(),
            step_id: result.step_id.clone(),
            status: result.status,
            tokens_used: result.tokens_used,
            duration_ms: result.duration_ms,
            attempts: result.attempts,
            error: result.error.clone(),
        };
        self.state.record_result(result);
        self.checkpoint_after(&step.id)?;
        let _ = self.event_tx.send(finished);
        self.emit_budget_transitions(step);
        Ok(())
    }

    fn checkpoint_after(&mut self, step_id: &str) -> Result<(), EngineError> {
        // Cancelled runs discard further checkpoints.
        if self.cancel_requested {
            return Ok(());
        }
        let checkpoint = Checkpoint::new(step_id, self.state.clone(), self.definition.clone());
        self.checkpoints.save(&checkpoint)?;
        let _ = self.event_tx.send(RunEvent::CheckpointSaved {
            run_id: self.state.run_id.clone(),
            step_id: step_id.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn emit_budget_transitions(&mut self, step: &StepSpec) {
        for scope in BudgetLedger::scopes_for(step.agent.as_deref()) {
            let tier = self.ledger.status(&scope);
            let previous = self.tiers.insert(scope.clone(), tier);
            let changed = previous.map_or(tier != BudgetTier::Ok, |p| p != tier);
            if changed {
                let _ = self.event_tx.send(RunEvent::BudgetTierChanged {
                    run_id: self.state.run_id.clone(),
                    scope,
                    tier,
                });
            }
        }
    }

    fn successful_outputs(&self) -> HashMap<String, Value> {
        self.state
            .results
            .values()
            .filter(|result| result.succeeded())
            .map(|result| (result.step_id.clone(), Value::Object(result.output.clone())))
            .collect()
    }

    fn drain_controls(&mut self) {
        while let Ok(command) = self.control_rx.try_recv() {
            self.apply_control(command);
        }
    }

    fn apply_control(&mut self, command: RunControl) {
        match command {
            RunControl::Pause => {
                if !self.paused && !self.cancel_requested {
                    self.paused = true;
                    self.emit_status(RunStatus::Paused, None);
                }
            }
            RunControl::Resume => {
                if self.paused {
                    self.paused = false;
                    self.state.status = RunStatus::Running;
                    self.emit_status(RunStatus::Running, None);
                }
            }
            RunControl::Cancel => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.paused = false;
                    self.cancel_tx.send_replace(true);
                    self.emit_status(RunStatus::Cancelled, Some("cancel requested; draining in-flight steps".to_string()));
                }
            }
        }
    }

    /// Idle pause: no in-flight work remains, so checkpoint the paused
    /// state (a crash while paused stays resumable) and block on the
    /// control channel for a resume or cancel.
    async fn wait_while_paused(&mut self) -> Result<(), EngineError> {
        self.state.status = RunStatus::Paused;
        let last_step = self.last_completed_step();
        self.checkpoint_after(&last_step)?;

        while self.paused && !self.cancel_requested && !self.control_closed {
            match self.control_rx.recv().await {
                Some(command) => self.apply_control(command),
                None => self.control_closed = true,
            }
        }
        Ok(())
    }

    fn check_deadline(&mut self) {
        if self.abort.is_none() && !self.cancel_requested && Instant::now() >= self.deadline {
            let detail = EngineError::Timeout(format!(
                "run exceeded its {}s global timeout",
                self.definition.timeout_seconds
            ))
            .to_string();
            warn!(run_id = %self.state.run_id, %detail, "aborting run");
            self.abort = Some(detail);
        }
    }

    fn last_completed_step(&self) -> String {
        self.state
            .results
            .keys()
            .next_back()
            .cloned()
            .unwrap_or_else(|| "start".to_string())
    }

    fn emit_status(&self, status: RunStatus, message: Option<String>) {
        let _ = self.event_tx.send(RunEvent::RunStatusChanged {
            run_id: self.state.run_id.clone(),
            status,
            message,
        });
    }

    /// The control channel closed while paused: return the paused,
    /// resumable state without marking the run terminal.
    fn finalize_paused(mut self) -> Result<RunState, EngineError> {
        self.state.status = RunStatus::Paused;
        info!(run_id = %self.state.run_id, "run paused");
        Ok(self.state)
    }

    fn finalize(mut self) -> Result<RunState, EngineError> {
        let status = if self.cancel_requested {
            RunStatus::Cancelled
        } else if self.abort.is_none()
            && self.state.results.len() == self.graph.step_count()
            && self.state.results.values().all(StepResult::succeeded)
        {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        self.state.status = status;
        self.state.finished_at = Some(Utc::now());
        self.state.error = match status {
            RunStatus::Failed => self
                .abort
                .take()
                .or_else(|| Some("one or more steps did not succeed".to_string())),
            _ => None,
        };

        // Terminal marker row: records the final status so the store can
        // tell resumable failures from completed and cancelled runs.
        let checkpoint = Checkpoint::new(self.last_completed_step(), self.state.clone(), self.definition.clone());
        self.checkpoints.save(&checkpoint)?;

        let _ = self.event_tx.send(RunEvent::RunCompleted {
            run_id: self.state.run_id.clone(),
            status,
            finished_at: self.state.finished_at.unwrap_or_else(Utc::now),
            error: self.state.error.clone(),
        });
        info!(
            run_id = %self.state.run_id,
            ?status,
            steps = self.state.completed_steps(),
            tokens = self.state.tokens_used,
            "run finished"
        );
        Ok(self.state)
    }
}

/// Budget denial under an aborting policy surfaces as a budget error; other
/// failures abort with their own detail.
fn abort_detail(failure: &StepFailure) -> String {
    match failure {
        StepFailure::BudgetDenied { scope } => EngineError::BudgetExceeded { scope: scope.clone() }.to_string(),
        other => other.to_string(),
    }
}

/// Substitution policies need their substitute configured up front.
fn validate_substitution_policies(definition: &PipelineDefinition) -> Result<(), EngineError> {
    for step in &definition.steps {
        match step.failure_policy(&definition.defaults) {
            FailurePolicy::Fallback if !matches!(step.fallback, Some(Value::Object(_))) => {
                return Err(EngineError::Validation(format!(
                    "step '{}' uses the fallback policy without a fallback output object",
                    step.id
                )));
            }
            FailurePolicy::ContinueWithDefault if !matches!(step.default_output, Some(Value::Object(_))) => {
                return Err(EngineError::Validation(format!(
                    "step '{}' uses the continue_with_default policy without a default output object",
                    step.id
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply declared defaults and reject missing required inputs.
fn resolve_run_inputs(
    definition: &PipelineDefinition,
    mut provided: JsonMap<String, Value>,
) -> Result<JsonMap<String, Value>, EngineError> {
    for (name, input) in &definition.inputs {
        if provided.contains_key(name) {
            continue;
        }
        if let Some(default) = &input.default {
            provided.insert(name.clone(), default.clone());
        } else if input.required {
            return Err(EngineError::Validation(format!("missing required input: {name}")));
        }
    }
    Ok(provided)
}

/// Re-apply the confirmed consumption of persisted results so a resumed
/// run enforces against what was already spent.
fn replay_consumption(ledger: &BudgetLedger, definition: &PipelineDefinition, state: &RunState) {
    for result in state.results.values() {
        if result.tokens_used > 0
            && let Some(step) = definition.step(&result.step_id)
        {
            ledger.consume(&BudgetLedger::scopes_for(step.agent.as_deref()), 0, result.tokens_used);
        }
    }
}
