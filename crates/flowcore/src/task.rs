use crate::{InstanceId, StepConfig, TaskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Core trait that every task executor implements
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Dispatch key matched against `StepConfig::task_type` (e.g. "script", "http")
    fn task_type(&self) -> &str;

    /// Perform one attempt of a step, or open a gate for external input
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError>;

    /// Optional: human-readable description for listings
    fn description(&self) -> &str {
        ""
    }
}

/// Execution context passed to each executor
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub instance_id: InstanceId,
    pub step_id: String,

    /// 1-based attempt number
    pub attempt: u32,

    /// Static configuration for this step
    pub config: StepConfig,

    /// Input resolved through the step's input mapping. Only these bindings
    /// are visible to the task.
    pub input: Map<String, Value>,
}

impl TaskContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, TaskError> {
        self.input
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| TaskError::MissingInput(name.to_string()))
    }

    /// Input value as a string, if present
    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.input.get(name).and_then(Value::as_str)
    }
}

/// What a single dispatch produced
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Finished(TaskResult),

    /// The step waits for an external actor; carries the form to present.
    AwaitingInput { form: Option<Value> },
}

impl TaskOutcome {
    pub fn success(output: Value) -> Self {
        TaskOutcome::Finished(TaskResult {
            success: true,
            output,
        })
    }

    pub fn failure(output: Value) -> Self {
        TaskOutcome::Finished(TaskResult {
            success: false,
            output,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: Value,
}

/// Sandboxed expression host used for step conditions and script bodies.
///
/// Implementations see nothing but the `scope` they are handed.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, TaskError>;

    /// Evaluate and coerce the result with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, TaskError> {
        self.evaluate(expression, scope).map(|v| truthy(&v))
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
