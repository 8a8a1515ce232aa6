use crate::executor::{ExecutorDeps, WorkflowExecutor};
use crate::recovery::{spawn_retry_driver, RecoverySweep};
use crate::registry::TaskRegistry;
use flowcore::{EventBus, Evaluator, ExecutionEvent, MemoryStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime: an executor wired to the in-memory store and event bus
pub struct FlowRuntime {
    executor: WorkflowExecutor,
    event_bus: Arc<EventBus>,
    store: MemoryStore,
}

impl FlowRuntime {
    /// Create a runtime backed by a fresh [`MemoryStore`]
    pub fn in_memory(
        registry: TaskRegistry,
        evaluator: Arc<dyn Evaluator>,
        config: RuntimeConfig,
    ) -> Self {
        let store = MemoryStore::new();
        let event_bus = Arc::new(EventBus::new(config.event_capacity()));
        let executor = WorkflowExecutor::new(
            ExecutorDeps {
                definitions: Arc::new(store.clone()),
                instances: Arc::new(store.clone()),
                registry: Arc::new(registry),
                evaluator,
                notifier: event_bus.clone(),
            },
            config,
        );

        Self {
            executor,
            event_bus,
            store,
        }
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start the retry timer driver and the recovery sweep. Both stop when
    /// `shutdown` is cancelled.
    pub fn start_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if let Some(driver) = spawn_retry_driver(self.executor.clone(), shutdown.clone()) {
            handles.push(driver);
        }
        let sweep = RecoverySweep::new(self.executor.clone(), self.executor.config());
        handles.push(sweep.spawn(shutdown));
        handles
    }
}

/// Configuration for the runtime. Every field has a default, so a partial
/// JSON document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Outer passes of one drive before it yields.
    pub max_iterations: u32,
    pub lock_timeout_ms: u64,
    /// Backoff cap for steps that do not set their own.
    pub max_retry_delay_ms: u64,
    pub recovery_interval_ms: u64,
    /// A `RUNNING` instance untouched for this long is re-driven by the sweep.
    pub stale_after_ms: u64,
    pub event_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Broadcast capacity; a zero buffer is raised to one slot.
    pub fn event_capacity(&self) -> usize {
        self.event_buffer_size.max(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            lock_timeout_ms: 30_000,
            max_retry_delay_ms: 30_000,
            recovery_interval_ms: 60_000,
            stale_after_ms: 300_000,
            event_buffer_size: 1000,
        }
    }
}
