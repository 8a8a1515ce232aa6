// crates/flowruntime/tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    Evaluator, InstanceId, MemoryStore, Notifier, TaskContext, TaskError, TaskExecutor,
    TaskOutcome, WorkflowInstance,
};
use flowruntime::{variables, ExecutorDeps, RuntimeConfig, TaskRegistry, WorkflowExecutor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type TaskFn = dyn Fn(&TaskContext) -> Result<TaskOutcome, TaskError> + Send + Sync;

/// Executor backed by a closure, counting its invocations.
pub struct FnTask {
    task_type: String,
    run: Box<TaskFn>,
    pub calls: AtomicU32,
}

impl FnTask {
    pub fn new(
        task_type: &str,
        run: impl Fn(&TaskContext) -> Result<TaskOutcome, TaskError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_type: task_type.to_string(),
            run: Box::new(run),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for FnTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.run)(&ctx)
    }
}

/// Parks every step it runs, presenting the configured form.
pub struct GateTask;

#[async_trait]
impl TaskExecutor for GateTask {
    fn task_type(&self) -> &str {
        "human"
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        Ok(TaskOutcome::AwaitingInput {
            form: ctx.config.form.clone(),
        })
    }
}

pub struct SlowTask {
    pub millis: u64,
}

#[async_trait]
impl TaskExecutor for SlowTask {
    fn task_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(TaskOutcome::success(json!({"slept": self.millis})))
    }
}

/// Resolves expressions as mapping paths; `true`/`false` literals are accepted.
pub struct PathEvaluator;

impl Evaluator for PathEvaluator {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, TaskError> {
        match expression.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "boom" => Err(TaskError::Condition("cannot evaluate boom".into())),
            path => Ok(variables::resolve_path(scope, path)
                .cloned()
                .unwrap_or(Value::Null)),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub changes: Mutex<Vec<(String, String)>>,
    pub durations: Mutex<Vec<f64>>,
}

impl RecordingNotifier {
    pub fn statuses_for(&self, entity_id: &str) -> Vec<String> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|(entity, _)| entity == entity_id)
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn duration_count(&self) -> usize {
        self.durations.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn on_state_change(&self, entity_id: &str, new_status: &str) {
        self.changes
            .lock()
            .unwrap()
            .push((entity_id.to_string(), new_status.to_string()));
    }

    fn on_execution_duration(&self, seconds: f64) {
        self.durations.lock().unwrap().push(seconds);
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub executor: WorkflowExecutor,
    pub notifier: Arc<RecordingNotifier>,
}

/// Registry with an `echo` task (output = resolved input), a `double` task
/// (`{value: n * 2}`), a `fail` task and the `human` gate.
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(FnTask::new("echo", |ctx| {
        Ok(TaskOutcome::success(Value::Object(ctx.input.clone())))
    }));
    registry.register(FnTask::new("double", |ctx| {
        let n = ctx.require_input("n")?.as_f64().unwrap_or_default();
        Ok(TaskOutcome::success(json!({ "value": n * 2.0 })))
    }));
    registry.register(FnTask::new("fail", |_| {
        Err(TaskError::Script("always fails".into()))
    }));
    registry.register(Arc::new(GateTask));
    registry
}

pub fn harness(registry: TaskRegistry) -> Harness {
    harness_with_config(registry, test_config())
}

/// Route engine logs to the test output; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with_config(registry: TaskRegistry, config: RuntimeConfig) -> Harness {
    init_tracing();
    let store = MemoryStore::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = WorkflowExecutor::new(
        ExecutorDeps {
            definitions: Arc::new(store.clone()),
            instances: Arc::new(store.clone()),
            registry: Arc::new(registry),
            evaluator: Arc::new(PathEvaluator),
            notifier: notifier.clone(),
        },
        config,
    );
    Harness {
        store,
        executor,
        notifier,
    }
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        lock_timeout_ms: 2_000,
        ..RuntimeConfig::default()
    }
}

/// Poll until the instance reaches a terminal status.
pub async fn wait_terminal(executor: &WorkflowExecutor, id: InstanceId) -> WorkflowInstance {
    for _ in 0..200 {
        let instance = executor.get_instance(id).await.unwrap();
        if instance.status.is_terminal() {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {id} did not reach a terminal status");
}
