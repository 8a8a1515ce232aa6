// crates/flowruntime/tests/human_task_test.rs

mod common;

use common::{default_registry, harness, Harness};
use flowcore::{FlowError, Step, StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus};
use flowruntime::resolver;
use serde_json::json;

fn review_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("review")
        .with_step(
            Step::human("review")
                .with_form(json!({"fields": [{"name": "approved", "type": "boolean"}]}))
                .with_output("approved", "$.output.approved"),
        )
        .with_step(
            Step::task("publish", "echo")
                .depends_on("review")
                .with_input("approved", "approved"),
        )
}

async fn start_review(h: &Harness) -> WorkflowInstance {
    let definition = h.executor.create_definition(review_definition()).await.unwrap();
    h.executor
        .start_workflow(definition.id, "DOC-1", json!({}))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_human_step_parks_with_form() {
    let h = harness(default_registry());
    let instance = start_review(&h).await;

    assert_eq!(instance.status, WorkflowStatus::Running);
    let review = instance.state.latest("review").unwrap();
    assert_eq!(review.status, StepStatus::AwaitingInput);
    assert_eq!(
        review.form.as_ref().unwrap()["fields"][0]["name"],
        "approved",
        "form is stored on the parked execution"
    );
    assert!(instance.state.latest("publish").is_none());

    let definition = review_definition();
    let parked: Vec<&str> = resolver::awaiting_input(&definition, &instance.state)
        .into_iter()
        .map(|step| step.id.as_str())
        .collect();
    assert_eq!(parked, vec!["review"]);
}

#[tokio::test]
async fn test_complete_human_task_resumes_workflow() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let instance = h
        .executor
        .complete_human_task(started.id, "review", json!({"approved": true}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.state.variables["approved"], json!(true));
    assert_eq!(
        instance.state.step_output("publish"),
        Some(&json!({"approved": true}))
    );
}

#[tokio::test]
async fn test_second_completion_is_not_found() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    h.executor
        .complete_human_task(started.id, "review", json!({"approved": true}))
        .await
        .unwrap();
    let err = h
        .executor
        .complete_human_task(started.id, "review", json!({"approved": false}))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::NotFound(_)));
}

#[tokio::test]
async fn test_completing_unknown_step_is_not_found() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let err = h
        .executor
        .complete_human_task(started.id, "publish", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
}

#[tokio::test]
async fn test_concurrent_completions_resolve_once() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let first = h.executor.clone();
    let second = h.executor.clone();
    let (a, b) = tokio::join!(
        first.complete_human_task(started.id, "review", json!({"approved": true})),
        second.complete_human_task(started.id, "review", json!({"approved": false})),
    );

    let outcomes = [a, b];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let not_found = outcomes
        .iter()
        .filter(|r| matches!(r, Err(FlowError::NotFound(_))))
        .count();
    assert_eq!((succeeded, not_found), (1, 1));

    let instance = h.executor.get_instance(started.id).await.unwrap();
    assert_eq!(instance.state.executions_for("review").count(), 1);
    assert_eq!(instance.state.executions_for("publish").count(), 1);
}

#[tokio::test]
async fn test_reject_fails_without_retry() {
    let h = harness(default_registry());
    let definition = WorkflowDefinition::new("strict")
        .with_step(Step::human("review").with_retry(5, 10, 2.0))
        .with_step(Step::task("publish", "echo").depends_on("review"));
    let definition = h.executor.create_definition(definition).await.unwrap();
    let started = h
        .executor
        .start_workflow(definition.id, "DOC-2", json!({}))
        .await
        .unwrap();

    let instance = h
        .executor
        .reject_human_task(started.id, "review", json!({"comments": "incomplete"}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    let review = instance.state.latest("review").unwrap();
    assert_eq!(review.status, StepStatus::Failed);
    assert_eq!(review.error.as_deref(), Some("Rejected: incomplete"));
    assert_eq!(instance.state.executions_for("review").count(), 1);
    assert!(instance.state.latest("publish").is_none());
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let paused = h.executor.pause_workflow(started.id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);

    let instance = h
        .executor
        .complete_human_task(started.id, "review", json!({"approved": true}))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Paused);
    assert!(instance.state.latest("publish").is_none(), "paused instances dispatch nothing");

    let resumed = h.executor.resume_workflow(started.id).await.unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let err = h.executor.resume_workflow(started.id).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_closes_parked_steps() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let cancelled = h.executor.cancel_workflow(started.id).await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    assert_eq!(
        cancelled.state.latest("review").unwrap().status,
        StepStatus::Cancelled
    );

    let err = h
        .executor
        .complete_human_task(started.id, "review", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));

    let err = h.executor.cancel_workflow(started.id).await.unwrap_err();
    assert!(matches!(err, FlowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_continue_is_idempotent_while_waiting() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let again = h.executor.continue_execution(started.id).await.unwrap();
    let third = h.executor.continue_execution(started.id).await.unwrap();

    assert_eq!(again, started);
    assert_eq!(third, started);
    assert_eq!(third.state.step_executions.len(), 1);
}

#[tokio::test]
async fn test_running_instances_keep_their_definition_version() {
    let h = harness(default_registry());
    let started = start_review(&h).await;

    let mut next = h.executor.get_definition(started.definition_id).await.unwrap();
    next.steps.push(Step::task("archive", "echo").depends_on("publish"));
    let next = h.executor.update_definition(next).await.unwrap();
    assert_eq!(next.version, 2);

    let instance = h
        .executor
        .complete_human_task(started.id, "review", json!({"approved": true}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.definition_version, 1);
    assert!(instance.state.latest("archive").is_none());
}
