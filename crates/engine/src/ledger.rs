//! Budget ledger: gates and accounts for token consumption.
//!
//! The ledger never blocks a caller — admission decisions return
//! immediately and enforcement is advisory-then-hard: estimates gate
//! dispatch, confirmed usage is the source of truth for the *next* request.
//! A step reserves against both its agent scope and the run scope; the
//! reservation converts to confirmed usage on `consume` and any remainder
//! auto-releases when the step reaches a terminal result, so a failed step
//! can never leak capacity.
//!
//! The ledger is shared across concurrently executing steps and guards its
//! allocations with a mutex; callers hold the lock only for the duration of
//! one accounting operation.

use std::sync::Mutex;

use indexmap::IndexMap;
use tracing::debug;

use loom_types::{BudgetAllocation, BudgetScope, BudgetTier, PipelineDefinition};

/// Caller-supplied degradation strategy.
///
/// Consulted by the executor when a scope reaches `Warning` or `Critical`
/// before a reservation is attempted. Strategies can veto dispatch or trim
/// the estimate (for example by capping requested output size); budget
/// strategy is a collaborator decision, not ledger internals.
pub trait BudgetStrategy: Send + Sync {
    /// Whether dispatch should proceed at the given tier.
    fn should_proceed(&self, scope: &BudgetScope, tier: BudgetTier) -> bool {
        let _ = (scope, tier);
        true
    }

    /// Adjusted token estimate to reserve at the given tier.
    fn adjust_request(&self, scope: &BudgetScope, tier: BudgetTier, estimated: u64) -> u64 {
        let _ = (scope, tier);
        estimated
    }
}

/// Default strategy: proceed with the estimate unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughStrategy;

impl BudgetStrategy for PassthroughStrategy {}

/// Token accounting for one run, keyed by scope.
#[derive(Debug)]
pub struct BudgetLedger {
    allocations: Mutex<IndexMap<BudgetScope, BudgetAllocation>>,
}

impl BudgetLedger {
    /// Build the ledger for a pipeline: one run-scope allocation plus one
    /// allocation per agent role referenced by a step. Agents without a
    /// configured budget default to the run-scope total, leaving the run
    /// allocation as the effective constraint.
    pub fn for_pipeline(definition: &PipelineDefinition) -> Self {
        let mut allocations = IndexMap::new();
        allocations.insert(BudgetScope::Run, BudgetAllocation::new(definition.token_budget));

        for step in &definition.steps {
            if let Some(agent) = &step.agent {
                let total = definition.agent_budgets.get(agent).copied().unwrap_or(definition.token_budget);
                allocations
                    .entry(BudgetScope::Agent(agent.clone()))
                    .or_insert_with(|| BudgetAllocation::new(total));
            }
        }

        Self {
            allocations: Mutex::new(allocations),
        }
    }

    /// Attempt to reserve `estimated` tokens against every scope at once.
    ///
    /// Returns `false` — reserving nothing — if any scope is already
    /// `Exceeded` or lacks `estimated` available tokens. On `true`, each
    /// scope carries the reservation until `consume` or `release` settles
    /// it.
    pub fn request(&self, scopes: &[BudgetScope], estimated: u64) -> bool {
        let mut allocations = self.allocations.lock().expect("ledger lock");

        for scope in scopes {
            let Some(allocation) = allocations.get(scope) else {
                return false;
            };
            if allocation.tier() == BudgetTier::Exceeded || allocation.available() < estimated {
                debug!(scope = %scope, estimated, available = allocation.available(), "budget reservation denied");
                return false;
            }
        }

        for scope in scopes {
            if let Some(allocation) = allocations.get_mut(scope) {
                allocation.reserved += estimated;
            }
        }
        true
    }

    /// Convert a reservation into confirmed usage.
    ///
    /// `reserved` is the amount previously granted by `request`; `actual`
    /// is what the handler reported. Actual exceeding the reservation is
    /// recorded in full — estimates are advisory and overconsumption may
    /// push the scope to `Exceeded`, which hard-denies the next request.
    pub fn consume(&self, scopes: &[BudgetScope], reserved: u64, actual: u64) {
        let mut allocations = self.allocations.lock().expect("ledger lock");
        for scope in scopes {
            if let Some(allocation) = allocations.get_mut(scope) {
                allocation.reserved = allocation.reserved.saturating_sub(reserved);
                allocation.used += actual;
            }
        }
    }

    /// Release an unconsumed reservation (step failed before `consume`).
    pub fn release(&self, scopes: &[BudgetScope], reserved: u64) {
        let mut allocations = self.allocations.lock().expect("ledger lock");
        for scope in scopes {
            if let Some(allocation) = allocations.get_mut(scope) {
                allocation.reserved = allocation.reserved.saturating_sub(reserved);
            }
        }
    }

    /// Current tier for a scope. Unknown scopes report `Exceeded` so a
    /// misrouted request can never be admitted.
    pub fn status(&self, scope: &BudgetScope) -> BudgetTier {
        let allocations = self.allocations.lock().expect("ledger lock");
        allocations.get(scope).map(BudgetAllocation::tier).unwrap_or(BudgetTier::Exceeded)
    }

    /// Read-only copy of a scope's allocation.
    pub fn snapshot(&self, scope: &BudgetScope) -> Option<BudgetAllocation> {
        let allocations = self.allocations.lock().expect("ledger lock");
        allocations.get(scope).copied()
    }

    /// Scopes a step with the given agent tag must be admitted against.
    pub fn scopes_for(agent: Option<&str>) -> Vec<BudgetScope> {
        match agent {
            Some(agent) => vec![BudgetScope::Agent(agent.to_string()), BudgetScope::Run],
            None => vec![BudgetScope::Run],
        }
    }
}
