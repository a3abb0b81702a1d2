//! Single-step dispatch: bindings → budget → permit → handler → settle.
//!
//! The dispatcher executes exactly one attempt of one step. It resolves the
//! step's input bindings, asks the ledger whether the attempt can be
//! afforded (letting the caller's budget strategy trim or veto the request
//! under pressure), acquires a provider permit from the governor, and
//! invokes the registered handler under the step's timeout. The observed
//! outcome flows back into the governor (throttle/recovery) and the ledger
//! (consume or release). Failure *policy* is not applied here — the
//! executor owns retry/skip/fallback decisions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::debug;

use loom_types::{BudgetScope, BudgetTier, PipelineDefaults, RunEvent, StepFailure, StepSpec};

use crate::governor::{ConcurrencyGovernor, LimitChange, LimitChangeKind, ProviderOutcome};
use crate::ledger::{BudgetLedger, BudgetStrategy};
use crate::resolve::{RunContext, resolve_bindings};

/// Resolved request handed to a step handler.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Run this attempt belongs to.
    pub run_id: String,
    /// Step being executed.
    pub step_id: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Fully resolved input bindings.
    pub inputs: JsonMap<String, Value>,
    /// Becomes `true` when the run is cancelled; handlers should stop at
    /// the next safe point. In-flight provider calls are never force-killed.
    pub cancel: watch::Receiver<bool>,
}

/// Successful handler response.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    /// Named output bindings visible to dependent steps.
    pub outputs: JsonMap<String, Value>,
    /// Tokens the provider reported consuming.
    pub tokens_used: u64,
}

impl HandlerOutput {
    /// Output with a single `text` binding, the common case for
    /// generative-text handlers.
    pub fn text(text: impl Into<String>, tokens_used: u64) -> Self {
        let mut outputs = JsonMap::new();
        outputs.insert("text".to_string(), Value::String(text.into()));
        Self { outputs, tokens_used }
    }
}

/// Contract every integration implements to execute a step.
///
/// The engine never inspects provider-specific payloads; handlers normalize
/// failures into [`StepFailure`] and report token usage on success.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute one attempt with the resolved inputs.
    async fn invoke(&self, invocation: StepInvocation) -> Result<HandlerOutput, StepFailure>;
}

/// Handler implementations keyed by handler-kind tag.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind tag, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Look up the handler for a kind tag.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(kind).cloned()
    }
}

/// Successful attempt, ready to become a `StepResult`.
#[derive(Debug, Clone)]
pub struct DispatchSuccess {
    /// Output bindings from the handler.
    pub outputs: JsonMap<String, Value>,
    /// Confirmed token usage.
    pub tokens_used: u64,
    /// Attempt duration in milliseconds.
    pub duration_ms: u64,
}

/// Failed attempt plus how long it took to fail.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    /// Normalized failure for the failure policy to resolve.
    pub failure: StepFailure,
    /// Attempt duration in milliseconds.
    pub duration_ms: u64,
}

/// Outcome of one dispatched attempt.
pub type DispatchResult = Result<DispatchSuccess, DispatchFailure>;

/// Executes one step attempt against the shared governor and ledger.
pub struct StepDispatcher {
    run_id: String,
    governor: Arc<ConcurrencyGovernor>,
    ledger: Arc<BudgetLedger>,
    registry: Arc<HandlerRegistry>,
    strategy: Arc<dyn BudgetStrategy>,
    defaults: PipelineDefaults,
    events: mpsc::UnboundedSender<RunEvent>,
}

impl StepDispatcher {
    /// Dispatcher for one run.
    pub fn new(
        run_id: impl Into<String>,
        governor: Arc<ConcurrencyGovernor>,
        ledger: Arc<BudgetLedger>,
        registry: Arc<HandlerRegistry>,
        strategy: Arc<dyn BudgetStrategy>,
        defaults: PipelineDefaults,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            governor,
            ledger,
            registry,
            strategy,
            defaults,
            events,
        }
    }

    /// Shared ledger for this run.
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Execute one attempt of `step` against the given context.
    pub async fn dispatch(&self, step: &StepSpec, context: &RunContext, cancel: watch::Receiver<bool>) -> DispatchResult {
        let started = Instant::now();

        let inputs = match resolve_bindings(&step.with, context) {
            Ok(inputs) => inputs,
            Err(failure) => return Err(self.failed(failure, started)),
        };

        let Some(handler) = self.registry.get(&step.handler) else {
            return Err(self.failed(
                StepFailure::validation(format!("no handler registered for kind '{}'", step.handler)),
                started,
            ));
        };

        // Budget admission: the strategy may veto or trim under pressure,
        // then both the agent scope and the run scope must accept the
        // reservation.
        let scopes = BudgetLedger::scopes_for(step.agent.as_deref());
        let mut estimated = step.estimated_tokens;
        for scope in &scopes {
            let tier = self.ledger.status(scope);
            if matches!(tier, BudgetTier::Warning | BudgetTier::Critical) {
                if !self.strategy.should_proceed(scope, tier) {
                    return Err(self.failed(StepFailure::BudgetDenied { scope: scope.clone() }, started));
                }
                estimated = self.strategy.adjust_request(scope, tier, estimated);
            }
        }
        if !self.ledger.request(&scopes, estimated) {
            let scope = self.denied_scope(&scopes, estimated);
            debug!(run_id = %self.run_id, step_id = %step.id, %scope, estimated, "budget denied dispatch");
            return Err(self.failed(StepFailure::BudgetDenied { scope }, started));
        }

        // Permit acquisition is bounded by the step's own timeout; waiting
        // here suspends only this step.
        let timeout = step.timeout(&self.defaults);
        let permit = match self.governor.acquire(&step.provider, timeout).await {
            Ok(permit) => permit,
            Err(failure) => {
                self.ledger.release(&scopes, estimated);
                return Err(self.failed(failure, started));
            }
        };

        let invocation = StepInvocation {
            run_id: self.run_id.clone(),
            step_id: step.id.clone(),
            attempt: context.attempt,
            inputs,
            cancel,
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        let outcome = time::timeout(remaining, handler.invoke(invocation)).await;
        drop(permit);

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Err(_elapsed) => {
                self.report(&step.provider, ProviderOutcome::OtherError);
                self.ledger.release(&scopes, estimated);
                Err(DispatchFailure {
                    failure: StepFailure::Timeout,
                    duration_ms,
                })
            }
            Ok(Err(failure)) => {
                let provider_outcome = match failure {
                    StepFailure::Throttled => ProviderOutcome::Throttled,
                    _ => ProviderOutcome::OtherError,
                };
                self.report(&step.provider, provider_outcome);
                self.ledger.release(&scopes, estimated);
                Err(DispatchFailure { failure, duration_ms })
            }
            Ok(Ok(output)) => {
                self.report(&step.provider, ProviderOutcome::Success);
                self.ledger.consume(&scopes, estimated, output.tokens_used);
                Ok(DispatchSuccess {
                    outputs: output.outputs,
                    tokens_used: output.tokens_used,
                    duration_ms,
                })
            }
        }
    }

    fn failed(&self, failure: StepFailure, started: Instant) -> DispatchFailure {
        DispatchFailure {
            failure,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Identify which scope refused a denied reservation for error detail.
    fn denied_scope(&self, scopes: &[BudgetScope], estimated: u64) -> BudgetScope {
        scopes
            .iter()
            .find(|scope| {
                self.ledger
                    .snapshot(scope)
                    .is_none_or(|allocation| allocation.tier() == BudgetTier::Exceeded || allocation.available() < estimated)
            })
            .cloned()
            .unwrap_or(BudgetScope::Run)
    }

    fn report(&self, provider: &str, outcome: ProviderOutcome) {
        if let Some(change) = self.governor.report_outcome(provider, outcome) {
            let LimitChange { provider, permitted, kind } = change;
            let event = match kind {
                LimitChangeKind::Throttled => RunEvent::ProviderThrottled { provider, permitted },
                LimitChangeKind::Recovered => RunEvent::ProviderRecovered { provider, permitted },
            };
            let _ = self.events.send(event);
        }
    }
}
