//! Dependency graph validation and wave computation.
//!
//! A pipeline executes as a sequence of waves: each wave is the set of steps
//! whose dependencies all live in earlier waves. Steps inside one wave have
//! no dependency edges between them and may be dispatched concurrently.
//! Wave membership is deterministic — steps appear in declaration order —
//! so repeated runs of the same definition schedule identically.

use std::collections::{HashMap, HashSet};

use loom_types::{EngineError, PipelineDefinition};

/// Validated execution graph for one pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGraph {
    waves: Vec<Vec<String>>,
}

impl ExecutionGraph {
    /// Validate the definition and compute its waves.
    ///
    /// Rejects duplicate step identifiers, dependencies on unknown steps,
    /// self-dependencies, and cycles with a [`EngineError::Validation`].
    pub fn build(definition: &PipelineDefinition) -> Result<Self, EngineError> {
        if definition.steps.is_empty() {
            return Err(EngineError::Validation(format!(
                "pipeline '{}' declares no steps",
                definition.pipeline
            )));
        }

        let mut known_ids: HashSet<&str> = HashSet::with_capacity(definition.steps.len());
        for step in &definition.steps {
            if !known_ids.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step identifier detected: '{}'",
                    step.id
                )));
            }
        }

        for step in &definition.steps {
            let mut seen = HashSet::new();
            for dependency in &step.depends_on {
                if dependency == &step.id {
                    return Err(EngineError::Validation(format!(
                        "step '{}' cannot depend on itself",
                        step.id
                    )));
                }
                if !known_ids.contains(dependency.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dependency
                    )));
                }
                if !seen.insert(dependency.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' lists dependency '{}' more than once",
                        step.id, dependency
                    )));
                }
            }
        }

        let waves = compute_waves(definition)?;
        Ok(Self { waves })
    }

    /// Waves in execution order, each listing step identifiers in
    /// declaration order.
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Total number of steps across all waves.
    pub fn step_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

/// Levelize steps: a step's wave index is one past the highest wave of its
/// dependencies. A round that settles no step means the remainder forms a
/// cycle.
fn compute_waves(definition: &PipelineDefinition) -> Result<Vec<Vec<String>>, EngineError> {
    let dependencies: HashMap<&str, &[String]> = definition
        .steps
        .iter()
        .map(|step| (step.id.as_str(), step.depends_on.as_slice()))
        .collect();

    let mut settled: HashSet<&str> = HashSet::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    while settled.len() < definition.steps.len() {
        let ready: Vec<&str> = definition
            .steps
            .iter()
            .filter(|step| !settled.contains(step.id.as_str()))
            .filter(|step| step.depends_on.iter().all(|dep| settled.contains(dep.as_str())))
            .map(|step| step.id.as_str())
            .collect();

        if ready.is_empty() {
            let mut remaining: Vec<&str> = dependencies
                .keys()
                .copied()
                .filter(|id| !settled.contains(id))
                .collect();
            remaining.sort_unstable();
            return Err(EngineError::Validation(format!(
                "cycle detected in pipeline steps involving: {}",
                remaining.join(", ")
            )));
        }

        settled.extend(ready.iter().copied());
        waves.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(waves)
}
