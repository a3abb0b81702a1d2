//! Template resolution for step input bindings.
//!
//! Bindings use the `${{ ... }}` template syntax and are resolved against a
//! [`RunContext`] of run inputs and prior step outputs just before a step is
//! dispatched. Supported expressions:
//!
//! - `${{ inputs.input_name }}` — run input value
//! - `${{ steps.step_id.output.field }}` — step output field access
//!   (the `output` segment is optional)
//! - `${{ attempt }}` — 1-based attempt counter for the step being resolved
//! - `${{ feedback }}` — failure detail from the previous attempt, empty on
//!   the first attempt
//!
//! Dot paths navigate nested objects; numeric segments index into arrays.
//! Unlike lenient template engines, an unresolved reference here is a hard
//! [`StepFailure::Validation`] — the owning step's failure policy decides
//! what happens next.

use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value};

use loom_types::StepFailure;

/// Execution context visible to binding resolution.
#[derive(Debug, Default, Clone)]
pub struct RunContext {
    /// Resolved run inputs.
    pub inputs: JsonMap<String, Value>,
    /// Output bindings of completed steps, keyed by step identifier.
    pub steps: HashMap<String, Value>,
    /// 1-based attempt counter for the step currently being resolved.
    pub attempt: u32,
    /// Failure detail from the previous attempt of this step, if any.
    pub feedback: Option<String>,
}

impl RunContext {
    /// Context for the first attempt of a step.
    pub fn new(inputs: JsonMap<String, Value>) -> Self {
        Self {
            inputs,
            steps: HashMap::new(),
            attempt: 1,
            feedback: None,
        }
    }
}

/// Resolve every binding in a step's `with` map.
///
/// Returns the fully interpolated bindings as the object handed to the
/// handler, or the first resolution failure encountered.
pub fn resolve_bindings(
    bindings: &indexmap::IndexMap<String, Value>,
    context: &RunContext,
) -> Result<JsonMap<String, Value>, StepFailure> {
    let mut resolved = JsonMap::new();
    for (name, value) in bindings {
        resolved.insert(name.clone(), interpolate_value(value, context)?);
    }
    Ok(resolved)
}

/// Recursively interpolate all template expressions in a JSON value.
pub fn interpolate_value(value: &Value, context: &RunContext) -> Result<Value, StepFailure> {
    match value {
        Value::String(string_value) => Ok(Value::String(interpolate_string(string_value, context)?)),
        Value::Array(array_values) => {
            let mut interpolated = Vec::with_capacity(array_values.len());
            for array_value in array_values {
                interpolated.push(interpolate_value(array_value, context)?);
            }
            Ok(Value::Array(interpolated))
        }
        Value::Object(object_map) => {
            let mut interpolated_map = JsonMap::new();
            for (key, entry) in object_map {
                interpolated_map.insert(key.clone(), interpolate_value(entry, context)?);
            }
            Ok(Value::Object(interpolated_map))
        }
        _ => Ok(value.clone()),
    }
}

/// Interpolate `${{ ... }}` templates inside one string.
fn interpolate_string(input_string: &str, context: &RunContext) -> Result<String, StepFailure> {
    let mut output_string = String::new();
    let mut remaining = input_string;

    while let Some(template_start) = remaining.find("${{") {
        let (before, after) = remaining.split_at(template_start);
        output_string.push_str(before);

        let Some(template_end) = after.find("}}") else {
            return Err(StepFailure::validation(format!(
                "unterminated template expression in '{input_string}'"
            )));
        };
        let expression = after[3..template_end].trim();
        output_string.push_str(&resolve_expression(expression, context)?);
        remaining = &after[template_end + 2..];
    }

    output_string.push_str(remaining);
    Ok(output_string)
}

/// Resolve a single expression to its string form.
fn resolve_expression(expression: &str, context: &RunContext) -> Result<String, StepFailure> {
    if expression == "attempt" {
        return Ok(context.attempt.to_string());
    }
    if expression == "feedback" {
        return Ok(context.feedback.clone().unwrap_or_default());
    }

    if let Some(rest) = expression.strip_prefix("inputs.") {
        let mut parts = rest.split('.');
        let input_name = parts.next().unwrap_or_default();
        let input_value = context
            .inputs
            .get(input_name)
            .ok_or_else(|| StepFailure::validation(format!("unknown input '{input_name}' in '{expression}'")))?;
        let path: Vec<&str> = parts.collect();
        return navigate_json_path(input_value, &path)
            .map(|v| format_json_value(&v))
            .ok_or_else(|| StepFailure::validation(format!("unresolved path in '{expression}'")));
    }

    if let Some(rest) = expression.strip_prefix("steps.") {
        let mut parts = rest.split('.');
        let step_id = parts.next().unwrap_or_default();
        let step_value = context
            .steps
            .get(step_id)
            .ok_or_else(|| StepFailure::validation(format!("no output recorded for step '{step_id}' in '{expression}'")))?;
        let mut path: Vec<&str> = parts.collect();
        // Allow an optional leading "output" segment for clarity.
        if path.first().copied() == Some("output") {
            path.remove(0);
        }
        return navigate_json_path(step_value, &path)
            .map(|v| format_json_value(&v))
            .ok_or_else(|| StepFailure::validation(format!("unresolved path in '{expression}'")));
    }

    Err(StepFailure::validation(format!("unsupported expression '{expression}'")))
}

/// Navigate a JSON value by object fields and array indices.
///
/// Returns `None` when any segment is missing or applied to the wrong JSON
/// type, so callers can surface the unresolved reference.
fn navigate_json_path(root_value: &Value, path_parts: &[&str]) -> Option<Value> {
    let mut current = root_value;
    for part in path_parts {
        match current {
            Value::Object(object_map) => current = object_map.get(*part)?,
            Value::Array(array_values) => {
                let index = part.parse::<usize>().ok()?;
                current = array_values.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}
