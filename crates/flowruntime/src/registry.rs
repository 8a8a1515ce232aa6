use flowcore::TaskExecutor;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available task executors, keyed by task type
pub struct TaskRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor. A later registration for the same type wins.
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        tracing::info!("Registering task type: {}", task_type);
        self.executors.insert(task_type, executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    /// Get all registered task types, sorted
    pub fn list_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn description(&self, task_type: &str) -> Option<&str> {
        self.executors.get(task_type).map(|e| e.description())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
