//! Workflow execution runtime
//!
//! This crate provides the execution coordinator that drives workflow
//! instances step by step, the task registry, dependency resolution,
//! variable mapping, retry scheduling and crash recovery.

mod executor;
mod lock;
mod recovery;
mod registry;
pub mod resolver;
pub mod retry;
mod runtime;
pub mod schema;
pub mod variables;

pub use executor::{ExecutorDeps, RetryTimer, WorkflowExecutor};
pub use lock::{InstanceGuard, InstanceLocks};
pub use recovery::{spawn_retry_driver, RecoveryReport, RecoverySweep, RECOVERED};
pub use registry::TaskRegistry;
pub use retry::{retry_deadline, RetryDecision, RetryPolicy};
pub use runtime::{FlowRuntime, RuntimeConfig};
