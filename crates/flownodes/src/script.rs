//! JEXL-backed expression host and the `script` task.
//!
//! Expressions are evaluated against a JSON context object only; values are
//! never interpolated into expression text.

use async_trait::async_trait;
use flowcore::{task_types, Evaluator, TaskContext, TaskError, TaskExecutor, TaskOutcome};
use serde_json::{json, Value};
use std::sync::Arc;

/// Expression evaluator with the standard transforms registered.
///
/// Accepts the `$.` root sigil used by mapping paths, JavaScript strict
/// equality operators, and a `return <expr>;` wrapper around script bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn engine() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("not", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!flowcore::truthy(&value)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("json", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(value.to_string()))
            })
    }

    /// Rewrite accepted surface syntax into plain JEXL.
    pub fn normalize(expression: &str) -> String {
        let mut body = expression.trim();
        if let Some(rest) = body.strip_prefix("return ") {
            body = rest.trim_start();
        }
        let body = body.trim_end_matches(|c: char| c == ';' || c.is_whitespace());

        // String literals are copied verbatim; only code between them is rewritten.
        let mut out = String::with_capacity(body.len());
        let mut code = String::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            if c != '\'' && c != '"' {
                code.push(c);
                continue;
            }
            out.push_str(&rewrite_syntax(&code));
            code.clear();
            out.push(c);
            while let Some(inner) = chars.next() {
                out.push(inner);
                if inner == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if inner == c {
                    break;
                }
            }
        }
        out.push_str(&rewrite_syntax(&code));
        out
    }
}

fn rewrite_syntax(code: &str) -> String {
    code.replace("$.", "")
        .replace("===", "==")
        .replace("!==", "!=")
}

impl Evaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, TaskError> {
        if !scope.is_object() {
            return Err(TaskError::Configuration(
                "expression context must be a JSON object".to_string(),
            ));
        }
        let normalized = Self::normalize(expression);
        if normalized.is_empty() {
            return Err(TaskError::Script("empty expression".to_string()));
        }

        Self::engine()
            .eval_in_context(&normalized, scope)
            .map_err(|e| TaskError::Script(format!("{}: {}", normalized, e)))
    }
}

/// Runs the step's script body with only `input` in scope.
pub struct ScriptTask {
    evaluator: Arc<dyn Evaluator>,
}

impl ScriptTask {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl TaskExecutor for ScriptTask {
    fn task_type(&self) -> &str {
        task_types::SCRIPT
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        let script = ctx
            .config
            .script_body()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| TaskError::Configuration("script step has no script body".to_string()))?;

        let scope = json!({ "input": Value::Object(ctx.input.clone()) });
        let output = self.evaluator.evaluate(script, &scope)?;

        tracing::debug!(
            instance_id = %ctx.instance_id,
            step_id = %ctx.step_id,
            "Script evaluated"
        );
        Ok(TaskOutcome::success(output))
    }

    fn description(&self) -> &str {
        "Evaluate a JEXL expression over the step input"
    }
}
