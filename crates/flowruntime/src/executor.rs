//! Execution coordinator.
//!
//! [`WorkflowExecutor`] owns the public operations on definitions and
//! instances. Every mutation of an instance happens under that instance's
//! lock and is persisted before the lock is released; notifications are sent
//! after the write they describe.

use crate::lock::InstanceLocks;
use crate::registry::TaskRegistry;
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::runtime::RuntimeConfig;
use crate::{resolver, schema, variables};
use chrono::Utc;
use dashmap::DashMap;
use flowcore::{
    step_entity_id, truthy, Condition, ConditionLanguage, DefinitionId, DefinitionRepository,
    Evaluator, FlowError, InstanceId, InstanceRepository, Notifier, Step, StepExecution, StepKind,
    StepStatus, TaskContext, TaskError, TaskOutcome, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ask the retry driver to re-enter an instance once `delay` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTimer {
    pub instance_id: InstanceId,
    pub delay: Duration,
}

/// Collaborators the executor is assembled from.
pub struct ExecutorDeps {
    pub definitions: Arc<dyn DefinitionRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub registry: Arc<TaskRegistry>,
    pub evaluator: Arc<dyn Evaluator>,
    pub notifier: Arc<dyn Notifier>,
}

/// Cheap to clone; all clones drive the same instances.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    registry: Arc<TaskRegistry>,
    evaluator: Arc<dyn Evaluator>,
    notifier: Arc<dyn Notifier>,
    locks: InstanceLocks,
    cancellations: DashMap<InstanceId, CancellationToken>,
    retry_policy: RetryPolicy,
    retry_tx: mpsc::UnboundedSender<RetryTimer>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryTimer>>>,
    config: RuntimeConfig,
}

enum HumanDecision {
    Complete,
    Reject,
}

impl WorkflowExecutor {
    pub fn new(deps: ExecutorDeps, config: RuntimeConfig) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                definitions: deps.definitions,
                instances: deps.instances,
                registry: deps.registry,
                evaluator: deps.evaluator,
                notifier: deps.notifier,
                locks: InstanceLocks::new(),
                cancellations: DashMap::new(),
                retry_policy: RetryPolicy::new(config.max_retry_delay()),
                retry_tx,
                retry_rx: Mutex::new(Some(retry_rx)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn instance_repository(&self) -> &Arc<dyn InstanceRepository> {
        &self.inner.instances
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.inner.locks
    }

    /// Hand out the receiving end of the retry timer channel. Only the first
    /// caller gets it.
    pub fn take_retry_receiver(&self) -> Option<mpsc::UnboundedReceiver<RetryTimer>> {
        self.inner
            .retry_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    // ---- definitions ----

    /// Validate and store a new definition as version 1.
    pub async fn create_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, FlowError> {
        definition.validate()?;
        definition.version = 1;
        self.inner.definitions.save(&definition).await?;
        info!(
            definition_id = %definition.id,
            name = %definition.name,
            steps = definition.steps.len(),
            "Workflow definition created"
        );
        Ok(definition)
    }

    /// Store a new version of an existing definition. Running instances keep
    /// the version they started with.
    pub async fn update_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, FlowError> {
        definition.validate()?;
        let current = self.get_definition(definition.id).await?;
        definition.version = current.version + 1;
        self.inner.definitions.save(&definition).await?;
        info!(
            definition_id = %definition.id,
            version = definition.version,
            "Workflow definition updated"
        );
        Ok(definition)
    }

    pub async fn get_definition(&self, id: DefinitionId) -> Result<WorkflowDefinition, FlowError> {
        self.inner
            .definitions
            .get_by_id(id)
            .await?
            .ok_or_else(|| FlowError::not_found(format!("workflow definition {}", id)))
    }

    // ---- instances ----

    /// Validate input, create a `PENDING` instance and drive it as far as it
    /// can go without external input.
    pub async fn start_workflow(
        &self,
        definition_id: DefinitionId,
        business_id: impl Into<String>,
        input: Value,
    ) -> Result<WorkflowInstance, FlowError> {
        let definition = self.get_definition(definition_id).await?;
        let business_id = business_id.into();

        let mut violations = schema::validate_input(&definition.input_schema, &input)
            .err()
            .unwrap_or_default();
        if business_id.trim().is_empty() {
            violations.push("businessId is required".to_string());
        }
        if !violations.is_empty() {
            warn!(
                definition_id = %definition_id,
                violations = ?violations,
                "Rejected workflow input"
            );
            return Err(FlowError::Validation(violations));
        }

        let instance =
            WorkflowInstance::new(definition.id, definition.version, business_id, input);
        self.inner.instances.save(&instance).await?;
        info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            business_id = %instance.business_id,
            "Workflow instance created"
        );
        self.notify_instance(&instance);

        self.continue_execution(instance.id).await
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        self.inner
            .instances
            .get_by_id(id)
            .await?
            .ok_or_else(|| FlowError::not_found(format!("workflow instance {}", id)))
    }

    /// Dispatch every ready step until none remain. Returns the instance as
    /// persisted. Re-entering with nothing ready is a no-op.
    pub async fn continue_execution(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        let _guard = self
            .inner
            .locks
            .acquire(id, self.inner.config.lock_timeout())
            .await?;
        self.drive(id).await
    }

    /// Finish a step parked in `AWAITING_INPUT` with the actor's output.
    pub async fn complete_human_task(
        &self,
        id: InstanceId,
        step_id: &str,
        output: Value,
    ) -> Result<WorkflowInstance, FlowError> {
        self.resolve_human_task(id, step_id, output, HumanDecision::Complete)
            .await?;
        self.continue_execution(id).await
    }

    /// Fail a step parked in `AWAITING_INPUT`. Rejection is terminal and is
    /// never retried.
    pub async fn reject_human_task(
        &self,
        id: InstanceId,
        step_id: &str,
        output: Value,
    ) -> Result<WorkflowInstance, FlowError> {
        self.resolve_human_task(id, step_id, output, HumanDecision::Reject)
            .await?;
        self.continue_execution(id).await
    }

    pub async fn pause_workflow(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        let _guard = self
            .inner
            .locks
            .acquire(id, self.inner.config.lock_timeout())
            .await?;
        let mut instance = self.get_instance(id).await?;
        instance.transition(WorkflowStatus::Paused)?;
        self.persist(&mut instance).await?;
        info!(instance_id = %id, "Workflow paused");
        self.notify_instance(&instance);
        Ok(instance)
    }

    pub async fn resume_workflow(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        {
            let _guard = self
                .inner
                .locks
                .acquire(id, self.inner.config.lock_timeout())
                .await?;
            let mut instance = self.get_instance(id).await?;
            instance.transition(WorkflowStatus::Running)?;
            self.persist(&mut instance).await?;
            info!(instance_id = %id, "Workflow resumed");
            self.notify_instance(&instance);
        }
        self.continue_execution(id).await
    }

    /// Stop an instance for good. A drive in progress stops at its next
    /// dispatch checkpoint; parked and retrying steps are cancelled.
    pub async fn cancel_workflow(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        if let Some(token) = self.inner.cancellations.get(&id) {
            token.cancel();
        }

        let _guard = self
            .inner
            .locks
            .acquire(id, self.inner.config.lock_timeout())
            .await?;
        let mut instance = self.get_instance(id).await?;
        instance.transition(WorkflowStatus::Cancelled)?;
        let cancelled = self.cancel_open_steps(&mut instance)?;
        self.persist(&mut instance).await?;

        info!(instance_id = %id, cancelled_steps = cancelled.len(), "Workflow cancelled");
        for step_id in &cancelled {
            self.notify_step(id, step_id, StepStatus::Cancelled);
        }
        self.notify_instance(&instance);
        self.notify_duration(&instance);
        Ok(instance)
    }

    // ---- driving ----

    async fn drive(&self, id: InstanceId) -> Result<WorkflowInstance, FlowError> {
        let mut instance = self.get_instance(id).await?;
        if instance.status.is_terminal() || instance.status == WorkflowStatus::Paused {
            debug!(instance_id = %id, status = %instance.status, "Nothing to drive");
            return Ok(instance);
        }

        let definition = self.load_definition(&instance).await?;
        let token = self.inner.cancellations.entry(id).or_default().clone();

        let result = self.run(&mut instance, &definition, &token).await;
        self.inner.cancellations.remove(&id);
        result?;

        self.schedule_retries(&instance, &definition);
        Ok(instance)
    }

    async fn run(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        token: &CancellationToken,
    ) -> Result<(), FlowError> {
        let before = instance.clone();

        if instance.status == WorkflowStatus::Pending {
            instance.transition(WorkflowStatus::Running)?;
            self.persist(instance).await?;
            info!(instance_id = %instance.id, "Workflow started");
            self.notify_instance(instance);
        }

        self.close_interrupted(instance, definition)?;

        let mut iterations = 0u32;
        'drive: loop {
            if token.is_cancelled() {
                info!(instance_id = %instance.id, "Cancellation requested; stopping dispatch");
                break;
            }

            let ready = resolver::ready_steps(definition, &instance.state, Utc::now());
            if ready.is_empty() {
                break;
            }

            iterations += 1;
            if iterations > self.inner.config.max_iterations {
                warn!(
                    instance_id = %instance.id,
                    max_iterations = self.inner.config.max_iterations,
                    "Iteration cap reached; leaving remaining steps for a later pass"
                );
                break;
            }

            for step in ready {
                if token.is_cancelled() {
                    break 'drive;
                }
                self.dispatch(instance, step).await?;
                if resolver::failed_step(definition, &instance.state).is_some() {
                    break 'drive;
                }
            }
        }

        self.finalize(instance, definition, &before).await
    }

    /// Close `RUNNING` records left behind by a crash as interrupted attempts.
    fn close_interrupted(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), FlowError> {
        for step in &definition.steps {
            let Some(index) = instance.state.latest_index(&step.id) else {
                continue;
            };
            if instance.state.step_executions[index].status != StepStatus::Running {
                continue;
            }
            warn!(
                instance_id = %instance.id,
                step_id = %step.id,
                "Found interrupted step execution"
            );
            self.record_failure(instance, step, index, TaskError::Interrupted)?;
        }
        Ok(())
    }

    async fn dispatch(&self, instance: &mut WorkflowInstance, step: &Step) -> Result<(), FlowError> {
        let attempts = match instance.state.latest_index(&step.id) {
            Some(index) => {
                let previous = &mut instance.state.step_executions[index];
                // Superseded by the attempt recorded below.
                previous.transition(StepStatus::Failed)?;
                previous.attempts + 1
            }
            None => 1,
        };

        let scope = variables::expression_scope(instance);
        let mut execution = StepExecution::new(&step.id, attempts);

        if let Some(condition) = &step.condition {
            match self.evaluate_condition(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    execution.transition(StepStatus::Skipped)?;
                    instance.state.step_executions.push(execution);
                    self.persist(instance).await?;
                    info!(
                        instance_id = %instance.id,
                        step_id = %step.id,
                        condition = %condition.expression,
                        "Step skipped"
                    );
                    self.notify_step(instance.id, &step.id, StepStatus::Skipped);
                    return Ok(());
                }
                Err(err) => {
                    execution.transition(StepStatus::Running)?;
                    instance.state.step_executions.push(execution);
                    let index = instance.state.step_executions.len() - 1;
                    self.record_failure(instance, step, index, err)?;
                    self.persist(instance).await?;
                    return Ok(());
                }
            }
        }

        let input = variables::resolve_input(&step.config.input_mapping, &scope);

        execution.transition(StepStatus::Running)?;
        instance.state.step_executions.push(execution);
        let index = instance.state.step_executions.len() - 1;
        self.persist(instance).await?;
        debug!(
            instance_id = %instance.id,
            step_id = %step.id,
            attempt = attempts,
            "Dispatching step"
        );
        self.notify_step(instance.id, &step.id, StepStatus::Running);

        let outcome = match step.kind {
            StepKind::Task => self.run_task(instance.id, step, attempts, input).await,
            StepKind::Decision | StepKind::Parallel => {
                Ok(TaskOutcome::success(Value::Object(input)))
            }
        };

        match outcome {
            Ok(TaskOutcome::Finished(result)) if result.success => {
                let state = &mut instance.state;
                let execution = &mut state.step_executions[index];
                execution.output = result.output;
                execution.transition(StepStatus::Completed)?;
                variables::apply_output(
                    &step.config.output_mapping,
                    &execution.output,
                    &mut state.variables,
                );
                info!(instance_id = %instance.id, step_id = %step.id, "Step completed");
            }
            Ok(TaskOutcome::Finished(result)) => {
                let summary = summarize(&result.output);
                instance.state.step_executions[index].output = result.output;
                self.record_failure(instance, step, index, TaskError::Unsuccessful(summary))?;
            }
            Ok(TaskOutcome::AwaitingInput { form }) => {
                let execution = &mut instance.state.step_executions[index];
                execution.form = form.or_else(|| step.config.form.clone());
                execution.transition(StepStatus::AwaitingInput)?;
                info!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    "Step waiting for external input"
                );
            }
            Err(err) => self.record_failure(instance, step, index, err)?,
        }

        self.persist(instance).await?;
        let status = instance.state.step_executions[index].status;
        self.notify_step(instance.id, &step.id, status);
        Ok(())
    }

    async fn run_task(
        &self,
        instance_id: InstanceId,
        step: &Step,
        attempt: u32,
        input: Map<String, Value>,
    ) -> Result<TaskOutcome, TaskError> {
        let task_type = step.task_type().unwrap_or_default();
        let executor = self
            .inner
            .registry
            .get(task_type)
            .ok_or_else(|| TaskError::UnknownTaskType(task_type.to_string()))?;

        let ctx = TaskContext {
            instance_id,
            step_id: step.id.clone(),
            attempt,
            config: step.config.clone(),
            input,
        };

        let guarded = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();
        let caught = match step.timeout {
            Some(millis) => {
                match tokio::time::timeout(Duration::from_millis(millis), guarded).await {
                    Ok(caught) => caught,
                    Err(_) => return Err(TaskError::Timeout { millis }),
                }
            }
            None => guarded.await,
        };

        caught.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))))
    }

    fn evaluate_condition(&self, condition: &Condition, scope: &Value) -> Result<bool, TaskError> {
        match condition.language {
            ConditionLanguage::Jexl => self
                .inner
                .evaluator
                .evaluate_bool(&condition.expression, scope)
                .map_err(|err| match err {
                    TaskError::Condition(_) => err,
                    other => TaskError::Condition(other.to_string()),
                }),
            ConditionLanguage::JsonPath => Ok(variables::resolve_path(scope, &condition.expression)
                .map_or(false, truthy)),
        }
    }

    /// Apply the retry policy to a failed attempt at `index`.
    fn record_failure(
        &self,
        instance: &mut WorkflowInstance,
        step: &Step,
        index: usize,
        err: TaskError,
    ) -> Result<(), FlowError> {
        let retry = step.retry();
        let execution = &mut instance.state.step_executions[index];
        execution.error = Some(err.to_string());

        match self.inner.retry_policy.decide(&retry, execution.attempts) {
            RetryDecision::RetryAfter(delay) => {
                execution.transition(StepStatus::Retrying)?;
                execution.next_retry_at = Some(retry::retry_deadline(Utc::now(), delay));
                warn!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    attempt = execution.attempts,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Step failed; retry scheduled"
                );
            }
            RetryDecision::GiveUp => {
                execution.transition(StepStatus::Failed)?;
                error!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    attempts = execution.attempts,
                    error = %err,
                    "Step failed"
                );
                instance.error = Some(format!("Step {} failed: {}", step.id, err));
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        before: &WorkflowInstance,
    ) -> Result<(), FlowError> {
        let mut cancelled = Vec::new();

        if instance.status == WorkflowStatus::Running {
            if let Some(failed) = resolver::failed_step(definition, &instance.state) {
                if instance.error.is_none() {
                    instance.error = failed.error.clone();
                }
                cancelled = self.cancel_open_steps(instance)?;
                instance.transition(WorkflowStatus::Failed)?;
            } else if resolver::all_terminal(definition, &instance.state) {
                let last_output = instance
                    .state
                    .step_executions
                    .iter()
                    .rev()
                    .find(|e| e.status == StepStatus::Completed)
                    .map(|e| &e.output);
                instance.output = schema::project_output(
                    &definition.output_schema,
                    &instance.state.variables,
                    last_output,
                );
                instance.transition(WorkflowStatus::Completed)?;
            }
        }

        if *instance == *before {
            return Ok(());
        }
        self.persist(instance).await?;

        if instance.status.is_terminal() {
            match instance.status {
                WorkflowStatus::Completed => info!(instance_id = %instance.id, "Workflow completed"),
                _ => error!(
                    instance_id = %instance.id,
                    error = instance.error.as_deref().unwrap_or_default(),
                    "Workflow failed"
                ),
            }
            for step_id in &cancelled {
                self.notify_step(instance.id, step_id, StepStatus::Cancelled);
            }
            self.notify_instance(instance);
            self.notify_duration(instance);
        }
        Ok(())
    }

    /// Cancel every parked or retrying step. Returns the affected step ids.
    fn cancel_open_steps(&self, instance: &mut WorkflowInstance) -> Result<Vec<String>, FlowError> {
        let mut cancelled = Vec::new();
        for execution in instance.state.step_executions.iter_mut() {
            if matches!(
                execution.status,
                StepStatus::AwaitingInput | StepStatus::Retrying
            ) {
                execution.transition(StepStatus::Cancelled)?;
                execution.next_retry_at = None;
                cancelled.push(execution.step_id.clone());
            }
        }
        Ok(cancelled)
    }

    async fn resolve_human_task(
        &self,
        id: InstanceId,
        step_id: &str,
        output: Value,
        decision: HumanDecision,
    ) -> Result<(), FlowError> {
        let _guard = self
            .inner
            .locks
            .acquire(id, self.inner.config.lock_timeout())
            .await?;

        let mut instance = self.get_instance(id).await?;
        let pending = || FlowError::not_found(format!("step {} awaiting input on instance {}", step_id, id));
        if instance.status.is_terminal() {
            return Err(pending());
        }
        let index = instance
            .state
            .latest_index(step_id)
            .filter(|&i| instance.state.step_executions[i].status == StepStatus::AwaitingInput)
            .ok_or_else(pending)?;

        let definition = self.load_definition(&instance).await?;
        let step = definition.find_step(step_id).ok_or_else(pending)?;

        let state = &mut instance.state;
        let execution = &mut state.step_executions[index];
        execution.output = output;
        variables::apply_output(&step.config.output_mapping, &execution.output, &mut state.variables);

        let status = match decision {
            HumanDecision::Complete => {
                execution.transition(StepStatus::Completed)?;
                info!(instance_id = %id, step_id, "Human task completed");
                StepStatus::Completed
            }
            HumanDecision::Reject => {
                let reason = execution
                    .output
                    .get("comments")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by actor")
                    .to_string();
                let err = TaskError::Rejected(reason);
                execution.error = Some(err.to_string());
                execution.transition(StepStatus::Failed)?;
                instance.error = Some(format!("Step {} failed: {}", step_id, err));
                warn!(instance_id = %id, step_id, "Human task rejected");
                StepStatus::Failed
            }
        };

        self.persist(&mut instance).await?;
        self.notify_step(id, step_id, status);
        Ok(())
    }

    /// Queue a timer for the earliest pending retry of a running instance.
    fn schedule_retries(&self, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        if instance.status != WorkflowStatus::Running {
            return;
        }
        let Some(at) = resolver::next_retry_at(definition, &instance.state) else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let timer = RetryTimer {
            instance_id: instance.id,
            delay,
        };
        if self.inner.retry_tx.send(timer).is_err() {
            debug!(instance_id = %instance.id, "Retry driver not running; recovery sweep will pick it up");
        }
    }

    pub(crate) async fn load_definition(&self, instance: &WorkflowInstance) -> Result<WorkflowDefinition, FlowError> {
        self.inner
            .definitions
            .get_version(instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| {
                FlowError::not_found(format!(
                    "workflow definition {} version {}",
                    instance.definition_id, instance.definition_version
                ))
            })
    }

    async fn persist(&self, instance: &mut WorkflowInstance) -> Result<(), FlowError> {
        instance.touch();
        self.inner.instances.save(instance).await?;
        Ok(())
    }

    fn notify_instance(&self, instance: &WorkflowInstance) {
        self.inner
            .notifier
            .on_state_change(&instance.id.to_string(), instance.status.as_str());
    }

    fn notify_step(&self, instance_id: InstanceId, step_id: &str, status: StepStatus) {
        self.inner
            .notifier
            .on_state_change(&step_entity_id(instance_id, step_id), status.as_str());
    }

    fn notify_duration(&self, instance: &WorkflowInstance) {
        if let (Some(start), Some(end)) = (instance.started_at, instance.completed_at) {
            let seconds = (end - start).num_milliseconds() as f64 / 1000.0;
            self.inner.notifier.on_execution_duration(seconds);
        }
    }
}

fn summarize(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => "no output".to_string(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
