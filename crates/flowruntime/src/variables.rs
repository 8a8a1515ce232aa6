//! Path-based mapping between instance state and step I/O.
//!
//! Paths are dot-separated and may carry a leading `$.` sigil:
//! `$.input.amount`, `$.steps.review.output.approved`, `$.variables.total`
//! or a bare variable name such as `total`. Resolution is lenient: a missing
//! segment yields "undefined" (the binding is simply absent), never an error.

use flowcore::{StepStatus, WorkflowInstance};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const SCOPE_ROOTS: [&str; 3] = ["input", "steps", "variables"];

/// Split a mapping path into segments, dropping the `$` root.
pub fn path_segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    trimmed
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Walk `segments` from `root`. Numeric segments index into arrays.
pub fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Build the read-only view steps and conditions resolve against:
/// `{ input, steps: { <id>: { output, status } }, variables }`.
pub fn expression_scope(instance: &WorkflowInstance) -> Value {
    let mut steps = Map::new();
    for execution in &instance.state.step_executions {
        // Later attempts overwrite earlier ones.
        let output = if execution.status == StepStatus::Completed {
            execution.output.clone()
        } else {
            Value::Null
        };
        steps.insert(
            execution.step_id.clone(),
            json!({ "output": output, "status": execution.status }),
        );
    }

    json!({
        "input": instance.input,
        "steps": steps,
        "variables": instance.state.variables,
    })
}

/// Resolve one path against a scope built by [`expression_scope`].
///
/// Paths rooted at `input`, `steps` or `variables` are walked from the scope;
/// anything else is looked up as a variable name.
pub fn resolve_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = path_segments(path);
    let first = segments.first()?;
    if SCOPE_ROOTS.contains(first) {
        lookup(scope, &segments)
    } else {
        scope.get("variables").and_then(|vars| lookup(vars, &segments))
    }
}

/// Produce a task's input record from its input mapping.
///
/// Unresolvable paths leave the binding out; executors decide whether a
/// missing input is an error.
pub fn resolve_input(mapping: &BTreeMap<String, String>, scope: &Value) -> Map<String, Value> {
    mapping
        .iter()
        .filter_map(|(name, path)| {
            resolve_path(scope, path).map(|value| (name.clone(), value.clone()))
        })
        .collect()
}

/// Copy mapped fields of a step result into the instance variables.
///
/// Mapping values address the result with an optional `output` root:
/// `$.output.approved`, `output.approved` and `approved` are equivalent, and
/// `$.output` copies the whole result. Fields missing from the result are
/// left untouched in `variables`.
pub fn apply_output(
    mapping: &BTreeMap<String, String>,
    result: &Value,
    variables: &mut Map<String, Value>,
) {
    for (variable, path) in mapping {
        let mut segments = path_segments(path);
        if segments.first() == Some(&"output") {
            segments.remove(0);
        }
        if let Some(value) = lookup(result, &segments) {
            variables.insert(variable.clone(), value.clone());
        }
    }
}
