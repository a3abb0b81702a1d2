//! End-to-end run lifecycle tests: scheduling, budgets, throttling,
//! checkpoint/resume, and operator controls, driven through scripted
//! handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value, json};
use tokio::sync::mpsc;
use tokio::time;

use loom_engine::{
    CheckpointStore, ExecutorConfig, GovernorConfig, HandlerOutput, HandlerRegistry, MemoryCheckpointStore, Orchestrator,
    RunControl, StepHandler, StepInvocation, WorkflowExecutor, parse_pipeline_str,
};
use loom_types::{PipelineDefinition, RunEvent, RunState, RunStatus, StepFailure, StepStatus};

/// Observations shared between a scripted handler and the test body.
#[derive(Default)]
struct Recorder {
    invocations: Mutex<Vec<String>>,
    inputs_seen: Mutex<Vec<(String, JsonMap<String, Value>)>>,
    spans: Mutex<Vec<(String, Instant, Instant)>>,
}

impl Recorder {
    fn invocation_count(&self, step_id: &str) -> usize {
        self.invocations.lock().unwrap().iter().filter(|id| *id == step_id).count()
    }
}

/// Handler whose behavior is scripted per step: optional delay, reported
/// token usage, and a number of failures before succeeding.
struct ScriptedHandler {
    recorder: Arc<Recorder>,
    delay: Duration,
    tokens: HashMap<String, u64>,
    failures: Mutex<HashMap<String, u32>>,
}

impl ScriptedHandler {
    fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            delay: Duration::ZERO,
            tokens: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_tokens(mut self, step_id: &str, tokens: u64) -> Self {
        self.tokens.insert(step_id.to_string(), tokens);
        self
    }

    fn with_failures(self, step_id: &str, count: u32) -> Self {
        self.failures.lock().unwrap().insert(step_id.to_string(), count);
        self
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    async fn invoke(&self, invocation: StepInvocation) -> Result<HandlerOutput, StepFailure> {
        let started = Instant::now();
        {
            let mut invocations = self.recorder.invocations.lock().unwrap();
            invocations.push(invocation.step_id.clone());
        }
        {
            let mut inputs_seen = self.recorder.inputs_seen.lock().unwrap();
            inputs_seen.push((invocation.step_id.clone(), invocation.inputs.clone()));
        }

        if !self.delay.is_zero() {
            time::sleep(self.delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&invocation.step_id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(StepFailure::provider("scripted failure"));
            }
        }

        {
            let mut spans = self.recorder.spans.lock().unwrap();
            spans.push((invocation.step_id.clone(), started, Instant::now()));
        }
        let tokens = self.tokens.get(&invocation.step_id).copied().unwrap_or(1);
        Ok(HandlerOutput::text(format!("{} output", invocation.step_id), tokens))
    }
}

fn registry_with(handler: ScriptedHandler) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("generate", Arc::new(handler));
    Arc::new(registry)
}

fn executor(registry: Arc<HandlerRegistry>, store: Arc<MemoryCheckpointStore>) -> WorkflowExecutor {
    WorkflowExecutor::new(registry, store, ExecutorConfig::default())
}

async fn run_to_end(
    executor: &WorkflowExecutor,
    definition: PipelineDefinition,
    inputs: JsonMap<String, Value>,
) -> (RunState, Vec<RunEvent>) {
    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let state = executor
        .start(definition, inputs, control_rx, event_tx)
        .await
        .expect("run completes");
    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    (state, events)
}

fn plan_build_test(token_budget: u64, build_policy: &str) -> PipelineDefinition {
    parse_pipeline_str(&format!(
        r#"
pipeline: review_change
token_budget: {token_budget}
inputs:
  task:
    required: true
steps:
  - id: plan
    handler: generate
    agent: planner
    estimated_tokens: 20
    with:
      prompt: "Plan: ${{{{ inputs.task }}}}"
  - id: build
    handler: generate
    agent: implementer
    depends_on: [plan]
    estimated_tokens: 90
    on_failure: {build_policy}
    with:
      prompt: "Build per ${{{{ steps.plan.text }}}}"
  - id: test
    handler: generate
    agent: tester
    depends_on: [build]
    estimated_tokens: 5
    with:
      prompt: "Test ${{{{ steps.build.text }}}}"
"#
    ))
    .expect("pipeline")
}

fn task_inputs() -> JsonMap<String, Value> {
    json!({"task": "add dark mode"}).as_object().cloned().unwrap()
}

#[tokio::test]
async fn happy_path_runs_every_step_and_flows_bindings() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_tokens("plan", 20).with_tokens("build", 30);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store.clone());

    let (state, events) = run_to_end(&executor, plan_build_test(1_000, "abort"), task_inputs()).await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.completed_steps(), 3);
    assert!(state.results.values().all(|result| result.succeeded()));
    assert_eq!(state.tokens_used, 20 + 30 + 1);

    // Bindings resolved against run inputs and prior outputs.
    let inputs_seen = recorder.inputs_seen.lock().unwrap();
    let plan_inputs = &inputs_seen.iter().find(|(id, _)| id == "plan").unwrap().1;
    assert_eq!(plan_inputs["prompt"], "Plan: add dark mode");
    let build_inputs = &inputs_seen.iter().find(|(id, _)| id == "build").unwrap().1;
    assert_eq!(build_inputs["prompt"], "Build per plan output");

    // Lifecycle events cover the full run.
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted {
            status: RunStatus::Completed,
            ..
        })
    ));
    let started: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::StepStarted { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["plan", "build", "test"]);
    assert!(events.iter().any(|event| matches!(event, RunEvent::CheckpointSaved { .. })));

    // Every completion checkpointed, plus the terminal marker.
    assert_eq!(store.row_count(), 4);
}

#[tokio::test]
async fn budget_denial_with_abort_fails_the_run() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_tokens("plan", 20);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store.clone());

    // plan consumes 20 of 100; build's estimate of 90 exceeds the 80 left.
    let (state, _events) = run_to_end(&executor, plan_build_test(100, "abort"), task_inputs()).await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.error.as_deref(), Some("budget exceeded for run"));
    assert!(state.results["plan"].succeeded());
    assert_eq!(state.results["build"].status, StepStatus::Failed);
    // The run halted: test never dispatched.
    assert!(!state.results.contains_key("test"));
    assert_eq!(recorder.invocation_count("build"), 0);
    assert_eq!(recorder.invocation_count("test"), 0);
}

#[tokio::test]
async fn budget_denial_with_skip_skips_dependents_but_keeps_plan() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_tokens("plan", 20);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store.clone());

    let (state, _events) = run_to_end(&executor, plan_build_test(100, "skip"), task_inputs()).await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.results["build"].status, StepStatus::Skipped);
    // test's dependency did not succeed, so it is skipped too.
    assert_eq!(state.results["test"].status, StepStatus::Skipped);
    assert_eq!(recorder.invocation_count("test"), 0);

    // plan's result survives in the latest checkpoint.
    let checkpoint = store.load_latest(&state.run_id).expect("load").expect("checkpoint");
    assert!(checkpoint.state.results["plan"].succeeded());
}

#[tokio::test]
async fn governor_serializes_steps_sharing_a_provider_pool() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_delay(Duration::from_millis(100));
    let store = Arc::new(MemoryCheckpointStore::new());

    let mut config = ExecutorConfig::default();
    config.governor.provider_base.insert("analysis".into(), 1);
    let executor = WorkflowExecutor::new(registry_with(handler), store, config);

    let definition = parse_pipeline_str(
        r#"
pipeline: scans
steps:
  - id: security_scan
    handler: generate
    provider: analysis
  - id: perf_scan
    handler: generate
    provider: analysis
"#,
    )
    .expect("pipeline");

    let started = Instant::now();
    let (state, _events) = run_to_end(&executor, definition, JsonMap::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(state.status, RunStatus::Completed);
    // Both executed, but the second waited for the first's permit: total
    // wall-clock is at least the sum of both durations, and the handler
    // spans never overlap.
    assert!(elapsed >= Duration::from_millis(200), "ran concurrently: {elapsed:?}");
    let spans = recorder.spans.lock().unwrap();
    assert_eq!(spans.len(), 2);
    let (_, a_start, a_end) = &spans[0];
    let (_, b_start, b_end) = &spans[1];
    assert!(*a_end <= *b_start || *b_end <= *a_start, "provider calls overlapped");
}

#[tokio::test]
async fn independent_steps_on_distinct_providers_overlap() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_delay(Duration::from_millis(100));
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: scans
steps:
  - id: security_scan
    handler: generate
    provider: alpha
  - id: perf_scan
    handler: generate
    provider: beta
"#,
    )
    .expect("pipeline");

    let started = Instant::now();
    let (state, _events) = run_to_end(&executor, definition, JsonMap::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(elapsed < Duration::from_millis(190), "steps were serialized: {elapsed:?}");
}

#[tokio::test]
async fn retry_reinvokes_with_feedback_until_success() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_failures("flaky", 2);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: retries
steps:
  - id: flaky
    handler: generate
    on_failure: retry
    max_retries: 3
    with:
      note: "${{ feedback }}"
      round: "${{ attempt }}"
"#,
    )
    .expect("pipeline");

    let (state, events) = run_to_end(&executor, definition, JsonMap::new()).await;

    assert_eq!(state.status, RunStatus::Completed);
    let result = &state.results["flaky"];
    assert!(result.succeeded());
    assert_eq!(result.attempts, 3);
    assert_eq!(recorder.invocation_count("flaky"), 3);

    // The prior failure is bound as feedback on re-dispatch.
    let inputs_seen = recorder.inputs_seen.lock().unwrap();
    assert_eq!(inputs_seen[0].1["note"], "");
    assert_eq!(inputs_seen[0].1["round"], "1");
    assert_eq!(inputs_seen[2].1["note"], "provider error: scripted failure");
    assert_eq!(inputs_seen[2].1["round"], "3");

    let retries = events
        .iter()
        .filter(|event| matches!(event, RunEvent::StepRetried { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn exhausted_retries_abort_the_run() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_failures("flaky", 10);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: retries
steps:
  - id: flaky
    handler: generate
    on_failure: retry
    max_retries: 2
"#,
    )
    .expect("pipeline");

    let (state, _events) = run_to_end(&executor, definition, JsonMap::new()).await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(recorder.invocation_count("flaky"), 2);
    assert!(state.error.as_deref().unwrap_or_default().contains("exhausted 2 attempts"));
}

#[tokio::test]
async fn fallback_substitutes_configured_output() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_failures("summarize", 10);
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: fallbacks
steps:
  - id: summarize
    handler: generate
    on_failure: fallback
    fallback:
      text: "summary unavailable"
  - id: publish
    handler: generate
    depends_on: [summarize]
    with:
      body: "${{ steps.summarize.text }}"
"#,
    )
    .expect("pipeline");

    let (state, _events) = run_to_end(&executor, definition, JsonMap::new()).await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.results["summarize"].output["text"], "summary unavailable");
    assert_eq!(state.results["summarize"].tokens_used, 0);

    let inputs_seen = recorder.inputs_seen.lock().unwrap();
    let publish_inputs = &inputs_seen.iter().find(|(id, _)| id == "publish").unwrap().1;
    assert_eq!(publish_inputs["body"], "summary unavailable");
}

#[tokio::test]
async fn resume_never_reinvokes_persisted_steps() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let definition = plan_build_test(1_000, "abort");

    // First run: build fails persistently and aborts the run.
    let first_recorder = Arc::new(Recorder::default());
    let first_handler = ScriptedHandler::new(first_recorder.clone())
        .with_tokens("plan", 20)
        .with_failures("build", u32::MAX);
    let first_executor = executor(registry_with(first_handler), store.clone());

    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let failed_state = first_executor
        .start_as("run-resume".into(), definition, task_inputs(), control_rx, event_tx)
        .await
        .expect("first run");
    assert_eq!(failed_state.status, RunStatus::Failed);
    assert_eq!(first_recorder.invocation_count("plan"), 1);

    // Second run against the same store, with the cause fixed.
    let second_recorder = Arc::new(Recorder::default());
    let second_handler = ScriptedHandler::new(second_recorder.clone()).with_tokens("build", 30);
    let second_executor = executor(registry_with(second_handler), store.clone());

    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let resumed = second_executor
        .resume("run-resume", control_rx, event_tx)
        .await
        .expect("resume");

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed_steps(), 3);
    // plan's persisted result was reused, never re-invoked.
    assert_eq!(second_recorder.invocation_count("plan"), 0);
    assert_eq!(second_recorder.invocation_count("build"), 1);
    // The re-dispatched failed step now counts from a fresh result.
    assert!(resumed.results["plan"].succeeded());
    assert!(resumed.results["build"].succeeded());
    assert_eq!(resumed.tokens_used, 20 + 30 + 1);
}

#[tokio::test]
async fn resume_of_unknown_run_errors() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone());
    let executor = executor(registry_with(handler), store.clone());

    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let error = executor.resume("run-unknown", control_rx, event_tx).await.expect_err("unknown run");
    assert!(error.to_string().contains("not found"));
}

#[tokio::test]
async fn cancel_drains_in_flight_and_blocks_resume() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_delay(Duration::from_millis(150));
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(WorkflowExecutor::new(
        registry_with(handler),
        store.clone(),
        ExecutorConfig::default(),
    ));

    let definition = parse_pipeline_str(
        r#"
pipeline: cancellable
steps:
  - id: slow
    handler: generate
  - id: after
    handler: generate
    depends_on: [slow]
"#,
    )
    .expect("pipeline");

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let driving = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .start_as("run-cancel".into(), definition, JsonMap::new(), control_rx, event_tx)
                .await
        })
    };

    time::sleep(Duration::from_millis(40)).await;
    control_tx.send(RunControl::Cancel).expect("send cancel");

    let state = driving.await.expect("join").expect("run returns");
    assert_eq!(state.status, RunStatus::Cancelled);
    // The in-flight step finished; the dependent was never dispatched.
    assert_eq!(recorder.invocation_count("slow"), 1);
    assert_eq!(recorder.invocation_count("after"), 0);

    // Cancelled runs are not resumable.
    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let error = executor.resume("run-cancel", control_rx, event_tx).await.expect_err("not resumable");
    assert!(error.to_string().contains("not resumable"));
}

#[tokio::test]
async fn orchestrator_pause_checkpoint_resume_round_trip() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone()).with_delay(Duration::from_millis(100));
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = Arc::new(WorkflowExecutor::new(
        registry_with(handler),
        store.clone(),
        ExecutorConfig::default(),
    ));
    let orchestrator = Orchestrator::new(executor, store.clone());

    let definition = parse_pipeline_str(
        r#"
pipeline: pausable
max_parallelism: 1
steps:
  - id: first
    handler: generate
  - id: second
    handler: generate
    depends_on: [first]
"#,
    )
    .expect("pipeline");

    let started = orchestrator.start(definition, JsonMap::new()).expect("start");
    let run_id = started.run_id.clone();

    time::sleep(Duration::from_millis(30)).await;
    orchestrator.pause(&run_id).expect("pause");

    // Waiting drops the control channel, so the paused drive loop settles
    // into a resumable paused state.
    let paused = orchestrator.wait(&run_id).await.expect("paused state");
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.completed_steps() < 2);

    let summaries = orchestrator.list_resumable().expect("list");
    assert!(summaries.iter().any(|summary| summary.run_id == run_id));

    let _resumed = orchestrator.resume(&run_id).expect("resume");
    let finished = orchestrator.wait(&run_id).await.expect("final state");
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.completed_steps(), 2);
    // The in-flight step from before the pause was not re-invoked.
    assert_eq!(recorder.invocation_count("first"), 1);
}

#[tokio::test]
async fn validation_rejects_bad_graphs_before_running() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone());
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: cyclic
steps:
  - id: a
    handler: generate
    depends_on: [b]
  - id: b
    handler: generate
    depends_on: [a]
"#,
    )
    .expect("pipeline parses; the graph is what is invalid");

    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let error = executor
        .start(definition, JsonMap::new(), control_rx, event_tx)
        .await
        .expect_err("cycle rejected");
    assert!(error.to_string().contains("cycle detected"));
    assert_eq!(recorder.invocation_count("a"), 0);
}

#[tokio::test]
async fn missing_binding_follows_failure_policy() {
    let recorder = Arc::new(Recorder::default());
    let handler = ScriptedHandler::new(recorder.clone());
    let store = Arc::new(MemoryCheckpointStore::new());
    let executor = executor(registry_with(handler), store);

    let definition = parse_pipeline_str(
        r#"
pipeline: bad_binding
steps:
  - id: broken
    handler: generate
    on_failure: skip
    with:
      prompt: "${{ inputs.never_provided }}"
  - id: unaffected
    handler: generate
"#,
    )
    .expect("pipeline");

    let (state, _events) = run_to_end(&executor, definition, JsonMap::new()).await;

    // The unresolved reference resolved through the step's skip policy;
    // the independent step still ran.
    assert_eq!(state.results["broken"].status, StepStatus::Skipped);
    assert!(state.results["broken"].error.as_deref().unwrap_or_default().contains("never_provided"));
    assert!(state.results["unaffected"].succeeded());
    assert_eq!(recorder.invocation_count("broken"), 0);
}
