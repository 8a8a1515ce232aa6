//! Dependency resolution over the definition's step list.
//!
//! Iteration always follows definition order, so identical state yields an
//! identical ready list.

use chrono::{DateTime, Utc};
use flowcore::{InstanceState, Step, StepExecution, StepStatus, WorkflowDefinition};

/// Steps eligible for dispatch at `now`.
///
/// A step is ready when it has never run (or its latest attempt is a due
/// retry) and every dependency's latest execution is `COMPLETED` or `SKIPPED`.
pub fn ready_steps<'a>(
    definition: &'a WorkflowDefinition,
    state: &InstanceState,
    now: DateTime<Utc>,
) -> Vec<&'a Step> {
    definition
        .steps
        .iter()
        .filter(|step| {
            let eligible = match state.latest(&step.id) {
                None => true,
                Some(execution) => execution.retry_due(now),
            };
            eligible && dependencies_satisfied(step, state)
        })
        .collect()
}

pub fn dependencies_satisfied(step: &Step, state: &InstanceState) -> bool {
    step.dependencies.iter().all(|dep| {
        state
            .latest(dep)
            .map_or(false, |execution| execution.status.satisfies_dependents())
    })
}

/// First step, in definition order, whose latest attempt failed terminally.
pub fn failed_step<'a>(
    definition: &WorkflowDefinition,
    state: &'a InstanceState,
) -> Option<&'a StepExecution> {
    definition
        .steps
        .iter()
        .filter_map(|step| state.latest(&step.id))
        .find(|execution| execution.status == StepStatus::Failed)
}

/// Every step has reached a terminal status.
pub fn all_terminal(definition: &WorkflowDefinition, state: &InstanceState) -> bool {
    definition.steps.iter().all(|step| {
        state
            .latest(&step.id)
            .map_or(false, |execution| execution.status.is_terminal())
    })
}

/// Earliest scheduled retry among the latest attempts, if any.
pub fn next_retry_at(definition: &WorkflowDefinition, state: &InstanceState) -> Option<DateTime<Utc>> {
    definition
        .steps
        .iter()
        .filter_map(|step| state.latest(&step.id))
        .filter(|execution| execution.status == StepStatus::Retrying)
        .filter_map(|execution| execution.next_retry_at)
        .min()
}

/// Steps parked waiting for an external actor.
pub fn awaiting_input<'a>(
    definition: &'a WorkflowDefinition,
    state: &InstanceState,
) -> Vec<&'a Step> {
    definition
        .steps
        .iter()
        .filter(|step| {
            state
                .latest(&step.id)
                .map_or(false, |execution| execution.status == StepStatus::AwaitingInput)
        })
        .collect()
}
