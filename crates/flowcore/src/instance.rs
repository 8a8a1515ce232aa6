use crate::{DefinitionId, FlowError, Result, StepStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type InstanceId = Uuid;

/// One execution of a definition against specific input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    /// Definition version active when the instance was started.
    pub definition_version: u32,
    pub business_id: String,
    pub input: Value,
    pub output: Value,
    pub status: WorkflowStatus,
    pub state: InstanceState,
    /// Message of the step error that failed the instance, if any.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// New `PENDING` instance; variables start as a copy of the input object.
    pub fn new(
        definition_id: DefinitionId,
        definition_version: u32,
        business_id: impl Into<String>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        let variables = input.as_object().cloned().unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            definition_id,
            definition_version,
            business_id: business_id.into(),
            input,
            output: Value::Object(Map::new()),
            status: WorkflowStatus::Pending,
            state: InstanceState {
                step_executions: Vec::new(),
                variables,
            },
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a workflow-level transition, rejecting moves outside the table.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        self.status
            .check_transition(next, &format!("instance {}", self.id))?;
        let now = Utc::now();
        if next == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Execution state owned by an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub step_executions: Vec<StepExecution>,
    pub variables: Map<String, Value>,
}

impl InstanceState {
    /// Most recent execution record for a step.
    pub fn latest(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions.iter().rev().find(|e| e.step_id == step_id)
    }

    pub fn latest_index(&self, step_id: &str) -> Option<usize> {
        self.step_executions.iter().rposition(|e| e.step_id == step_id)
    }

    pub fn executions_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.step_executions.iter().filter(move |e| e.step_id == step_id)
    }

    /// Output of the latest completed execution of a step.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.latest(step_id)
            .filter(|e| e.status == StepStatus::Completed)
            .map(|e| &e.output)
    }
}

/// Record of one attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// When a `RETRYING` record becomes eligible for re-dispatch.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Form schema shown to the actor of a human step.
    #[serde(default)]
    pub form: Option<Value>,
}

impl StepExecution {
    pub fn new(step_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            attempts,
            output: Value::Null,
            error: None,
            next_retry_at: None,
            form: None,
        }
    }

    /// Apply a step-level transition; terminal statuses stamp `end_time`.
    pub fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                entity: format!("step {}", self.step_id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next.is_terminal() || next == StepStatus::Retrying {
            self.end_time = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Due for another attempt at `now`.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Retrying && self.next_retry_at.map_or(true, |at| at <= now)
    }
}
