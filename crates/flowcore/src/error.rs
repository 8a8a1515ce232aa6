use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid workflow input: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid definition: {0}")]
    Dependency(#[from] DefinitionError),

    #[error("Task execution failed: {0}")]
    TaskExecution(#[from] TaskError),

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Timed out after {waited_ms}ms waiting for lock on instance {instance_id}")]
    LockTimeout { instance_id: Uuid, waited_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl FlowError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FlowError::NotFound(what.into())
    }

    /// Every violation reported by a `Validation` error, empty otherwise.
    pub fn violations(&self) -> &[String] {
        match self {
            FlowError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

/// Failure of a single step attempt. Always recovered into a step execution record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("No executor registered for task type '{0}'")]
    UnknownTaskType(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Task reported failure: {0}")]
    Unsuccessful(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error("Interrupted before completion")]
    Interrupted,

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Integrity problems found while validating a definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Definition has no steps")]
    NoSteps,

    #[error("Step id must not be empty")]
    EmptyStepId,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cyclic dependency detected involving step '{0}'")]
    CyclicDependency(String),

    #[error("Task step '{0}' has no task type")]
    MissingTaskType(String),

    #[error("Invalid retry config on step '{step}': {reason}")]
    InvalidRetry { step: String, reason: String },
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Write conflict: {0}")]
    Conflict(String),
}
