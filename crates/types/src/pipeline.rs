//! Strongly typed pipeline schema definitions shared across the loader,
//! engine, and operator surface.
//!
//! A pipeline document declares run inputs, a dependency graph of steps,
//! token budgets, and failure handling. The models preserve authoring order
//! (via `IndexMap`) so wave grouping and summaries render in a predictable
//! sequence.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Fully resolved pipeline ready for engine consumption.
///
/// Loaded once per run and immutable afterwards. Step identifiers must be
/// unique, dependency references must resolve, and the graph must be
/// acyclic; the engine rejects definitions violating any of these before a
/// run starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    /// Canonical identifier used for lookups and telemetry.
    pub pipeline: String,
    /// Optional descriptive copy surfaced by operator tooling.
    #[serde(default)]
    pub description: Option<String>,
    /// Declarative run inputs keyed by authoring order.
    #[serde(default = "default_input_map")]
    pub inputs: IndexMap<String, InputSpec>,
    /// Steps forming the execution graph.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Run-scope token budget.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// Per-agent token budgets keyed by agent role tag. Agents without an
    /// entry share the run-scope budget only.
    #[serde(default = "default_budget_map")]
    pub agent_budgets: IndexMap<String, u64>,
    /// Global wall-clock bound for the whole run, in seconds.
    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,
    /// Upper bound on concurrently dispatched steps within a wave.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Defaults applied to steps that omit retry/timeout/failure settings.
    #[serde(default)]
    pub defaults: PipelineDefaults,
}

impl PipelineDefinition {
    /// Look up a step by identifier.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Global run timeout as a `Duration`.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Declarative run input definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    /// Descriptive text explaining the purpose of the input.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether a value must be supplied (or defaulted) before the run starts.
    #[serde(default)]
    pub required: bool,
    /// Literal default applied when the caller supplies no value.
    #[serde(default)]
    pub default: Option<JsonValue>,
}

/// Fallback settings for steps that omit their own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefaults {
    /// Retry ceiling for steps using the `retry` failure policy.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-step timeout in seconds, measured from dispatch start.
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// Failure policy applied when a step declares none.
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_seconds: default_step_timeout(),
            on_failure: FailurePolicy::default(),
        }
    }
}

/// What the engine does when a step reaches a terminal failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the run failed and stop dispatching further steps.
    #[default]
    Abort,
    /// Mark the step skipped; dependents that tolerate a skipped
    /// predecessor stay eligible.
    Skip,
    /// Re-dispatch the step with a fresh timeout, up to its retry ceiling.
    Retry,
    /// Substitute the statically configured `fallback` output.
    Fallback,
    /// Substitute the configured `default_output` without re-invoking the
    /// handler.
    ContinueWithDefault,
}

/// Describes a single step within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Unique step identifier referenced by bindings and dependencies.
    pub id: String,
    /// Handler-kind tag resolved against the handler registry.
    pub handler: String,
    /// Agent role tag naming the (run, agent) budget scope. Roles are
    /// configuration, not a type hierarchy.
    #[serde(default)]
    pub agent: Option<String>,
    /// Provider pool tag used for concurrency and rate grouping.
    #[serde(default = "default_provider_tag")]
    pub provider: String,
    /// Dependency list ensuring this step runs after its prerequisites.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input bindings handed to the handler, with `${{ ... }}` template
    /// expressions resolved against run inputs and prior step outputs.
    #[serde(default = "default_binding_map")]
    pub with: IndexMap<String, JsonValue>,
    /// Advisory token estimate reserved before dispatch.
    #[serde(default = "default_estimated_tokens")]
    pub estimated_tokens: u64,
    /// Per-step timeout override in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Failure policy override.
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
    /// Retry ceiling override for the `retry` policy.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Static output substituted by the `fallback` policy. Must be a JSON
    /// object of named output bindings.
    #[serde(default)]
    pub fallback: Option<JsonValue>,
    /// Output substituted by the `continue_with_default` policy.
    #[serde(default)]
    pub default_output: Option<JsonValue>,
    /// When true, a skipped dependency does not block this step.
    #[serde(default)]
    pub allow_skipped_deps: bool,
}

impl StepSpec {
    /// Effective failure policy, falling back to the pipeline defaults.
    pub fn failure_policy(&self, defaults: &PipelineDefaults) -> FailurePolicy {
        self.on_failure.unwrap_or(defaults.on_failure)
    }

    /// Effective retry ceiling, falling back to the pipeline defaults.
    pub fn retry_limit(&self, defaults: &PipelineDefaults) -> u32 {
        self.max_retries.unwrap_or(defaults.max_retries)
    }

    /// Effective per-step timeout, falling back to the pipeline defaults.
    pub fn timeout(&self, defaults: &PipelineDefaults) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(defaults.timeout_seconds))
    }
}

/// Provider tag applied to steps that declare none.
pub const DEFAULT_PROVIDER_TAG: &str = "default";

fn default_provider_tag() -> String {
    DEFAULT_PROVIDER_TAG.to_string()
}

const fn default_token_budget() -> u64 {
    100_000
}

const fn default_run_timeout() -> u64 {
    3_600
}

const fn default_step_timeout() -> u64 {
    300
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_max_parallelism() -> usize {
    4
}

const fn default_estimated_tokens() -> u64 {
    1_000
}

fn default_input_map() -> IndexMap<String, InputSpec> {
    IndexMap::new()
}

fn default_budget_map() -> IndexMap<String, u64> {
    IndexMap::new()
}

fn default_binding_map() -> IndexMap<String, JsonValue> {
    IndexMap::new()
}
