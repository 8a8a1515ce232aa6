use async_trait::async_trait;
use flowcore::{task_types, TaskContext, TaskError, TaskExecutor, TaskOutcome};

/// Opens a gate for an external actor. The step stays `AWAITING_INPUT`
/// until the instance receives a completion or rejection for it.
pub struct HumanTask;

#[async_trait]
impl TaskExecutor for HumanTask {
    fn task_type(&self) -> &str {
        task_types::HUMAN
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        tracing::info!(
            instance_id = %ctx.instance_id,
            step_id = %ctx.step_id,
            "Human task waiting for user action"
        );
        Ok(TaskOutcome::AwaitingInput {
            form: ctx.config.form,
        })
    }

    fn description(&self) -> &str {
        "Wait for a person to complete or reject the step"
    }
}
