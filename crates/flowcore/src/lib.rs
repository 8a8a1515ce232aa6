//! Core abstractions for the flow engine
//!
//! This crate provides the data model (definitions, instances, step
//! executions), the status state machines, the error taxonomy and the
//! traits the engine is assembled from. It contains no execution logic.

mod error;
pub mod events;
mod instance;
pub mod repository;
mod status;
mod task;
mod workflow;

pub use error::{DefinitionError, FlowError, StoreError, TaskError};
pub use events::*;
pub use instance::{InstanceId, InstanceState, StepExecution, WorkflowInstance};
pub use repository::{DefinitionRepository, InstanceRepository, MemoryStore};
pub use status::{StepStatus, WorkflowStatus};
pub use task::{truthy, Evaluator, TaskContext, TaskExecutor, TaskOutcome, TaskResult};
pub use workflow::{
    task_types, Condition, ConditionLanguage, DefinitionId, RetryConfig, Step, StepConfig,
    StepId, StepKind, WorkflowDefinition,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
