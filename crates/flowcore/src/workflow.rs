use crate::DefinitionError;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type DefinitionId = Uuid;
pub type StepId = String;

/// Built-in task types understood by the standard executors.
pub mod task_types {
    pub const SCRIPT: &str = "script";
    pub const HTTP: &str = "http";
    pub const HUMAN: &str = "human";
}

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: DefinitionId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
    #[serde(default = "empty_schema")]
    pub output_schema: Value,
    #[serde(default = "first_version")]
    pub version: u32,
}

fn empty_schema() -> Value {
    json!({ "type": "object" })
}

fn first_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            input_schema: empty_schema(),
            output_schema: empty_schema(),
            version: first_version(),
        }
    }

    pub fn add_step(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Fail-fast integrity check: unique ids, known dependencies, no cycles.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps);
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut step_to_index = HashMap::new();

        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(DefinitionError::EmptyStepId);
            }
            if step_to_index.contains_key(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
            step_to_index.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
            step.validate_config()?;
        }

        for step in &self.steps {
            let to_idx = step_to_index[step.id.as_str()];
            for dep in &step.dependencies {
                let from_idx = step_to_index.get(dep.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*from_idx, to_idx, ());
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| DefinitionError::CyclicDependency(graph[cycle.node_id()].to_string()))?;

        Ok(())
    }
}

/// One node of the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StepKind,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    /// Upper bound for one automated attempt, in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Step {
    pub fn task(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: StepKind::Task,
            dependencies: Vec::new(),
            config: StepConfig {
                task_type: Some(task_type.into()),
                ..StepConfig::default()
            },
            retry_config: None,
            timeout: None,
            condition: None,
        }
    }

    pub fn script(id: impl Into<String>, script: impl Into<String>) -> Self {
        let mut step = Self::task(id, task_types::SCRIPT);
        step.config.script = Some(script.into());
        step
    }

    pub fn http(id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        let mut step = Self::task(id, task_types::HTTP);
        step.config.method = Some(method.into());
        step.config.url = Some(url.into());
        step
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self::task(id, task_types::HUMAN)
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Bind `name` in the task input to the value found at `path`.
    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.config.input_mapping.insert(name.into(), path.into());
        self
    }

    /// Copy the output field at `path` into the instance variable `variable`.
    pub fn with_output(mut self, variable: impl Into<String>, path: impl Into<String>) -> Self {
        self.config.output_mapping.insert(variable.into(), path.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        self.retry_config = Some(RetryConfig {
            max_attempts,
            backoff_multiplier,
            initial_delay: initial_delay_ms,
            max_delay: None,
        });
        self
    }

    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(Condition {
            expression: expression.into(),
            language: ConditionLanguage::Jexl,
        });
        self
    }

    pub fn with_form(mut self, form: Value) -> Self {
        self.config.form = Some(form);
        self
    }

    pub fn task_type(&self) -> Option<&str> {
        self.config.task_type.as_deref()
    }

    pub fn is_human(&self) -> bool {
        self.kind == StepKind::Task && self.task_type() == Some(task_types::HUMAN)
    }

    /// Retry settings in effect; steps without a retry config fail fast.
    pub fn retry(&self) -> RetryConfig {
        self.retry_config.clone().unwrap_or_else(RetryConfig::fail_fast)
    }

    fn validate_config(&self) -> Result<(), DefinitionError> {
        if self.kind == StepKind::Task
            && self.task_type().map_or(true, |t| t.trim().is_empty())
        {
            return Err(DefinitionError::MissingTaskType(self.id.clone()));
        }
        if let Some(retry) = &self.retry_config {
            let reason = if retry.max_attempts == 0 {
                Some("maxAttempts must be at least 1")
            } else if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                Some("backoffMultiplier must be a finite number >= 1")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DefinitionError::InvalidRetry {
                    step: self.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    #[default]
    #[serde(alias = "task")]
    Task,
    #[serde(alias = "decision")]
    Decision,
    #[serde(alias = "parallel")]
    Parallel,
}

/// Per-step task configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Dispatch key for the task executor registry (`script`, `http`, `human`, ...).
    #[serde(default, alias = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub form: Option<Value>,
}

impl StepConfig {
    /// Script body, falling back to `handler` for definitions that put it there.
    pub fn script_body(&self) -> Option<&str> {
        self.script.as_deref().or(self.handler.as_deref())
    }
}

/// Retry policy for a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default = "default_multiplier", alias = "backoffFactor")]
    pub backoff_multiplier: f64,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay", alias = "initialInterval")]
    pub initial_delay: u64,
    /// Per-step cap on the delay, in milliseconds.
    #[serde(default)]
    pub max_delay: Option<u64>,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_initial_delay() -> u64 {
    1000
}

impl RetryConfig {
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: default_multiplier(),
            initial_delay: default_initial_delay(),
            max_delay: None,
        }
    }
}

/// Guard evaluated before a step is dispatched; false skips the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub expression: String,
    #[serde(default, alias = "type")]
    pub language: ConditionLanguage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLanguage {
    #[default]
    #[serde(alias = "javascript")]
    Jexl,
    #[serde(alias = "jsonPath")]
    JsonPath,
}
