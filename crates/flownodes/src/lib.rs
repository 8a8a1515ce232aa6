//! Standard task library
//!
//! Built-in executors for the `script`, `http` and `human` task types, and
//! the JEXL evaluator used for scripts and step conditions.

mod http;
mod human;
mod script;

pub use http::HttpTask;
pub use human::HumanTask;
pub use script::{JexlEvaluator, ScriptTask};

use flowcore::Evaluator;
use flowruntime::TaskRegistry;
use std::sync::Arc;

/// Register all standard tasks with a registry
pub fn register_all(registry: &mut TaskRegistry, evaluator: Arc<dyn Evaluator>) {
    registry.register(Arc::new(ScriptTask::new(evaluator)));
    registry.register(Arc::new(HttpTask::new()));
    registry.register(Arc::new(HumanTask));
}

/// A registry holding every standard task, scripts evaluated with JEXL.
pub fn standard_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    register_all(&mut registry, Arc::new(JexlEvaluator::new()));
    registry
}
