// crates/flownodes/tests/scenario_test.rs
//
// End-to-end runs through the runtime with the standard task library.

use flowcore::{
    ExecutionEvent, FlowError, Step, StepKind, StepStatus, WorkflowDefinition, WorkflowStatus,
};
use flownodes::{standard_registry, JexlEvaluator};
use flowruntime::{FlowRuntime, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn runtime() -> FlowRuntime {
    FlowRuntime::in_memory(
        standard_registry(),
        Arc::new(JexlEvaluator::new()),
        RuntimeConfig::default(),
    )
}

fn approval_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("approval")
        .with_input_schema(json!({
            "type": "object",
            "required": ["requestId", "amount"],
            "properties": {
                "requestId": { "type": "string" },
                "amount": { "type": "number" }
            }
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "approved": { "type": "boolean" },
                "comments": { "type": "string" }
            }
        }))
        .with_step(
            Step::human("approve")
                .with_input("amount", "$.input.amount")
                .with_form(json!({
                    "fields": [
                        { "name": "approved", "type": "boolean" },
                        { "name": "comments", "type": "string" }
                    ]
                }))
                .with_output("approved", "$.output.approved")
                .with_output("comments", "$.output.comments"),
        )
}

#[tokio::test]
async fn test_single_script_step() {
    let runtime = runtime();
    let definition = WorkflowDefinition::new("double").with_step(
        Step::script("double", "return {value: input.initialValue * 2}")
            .with_input("initialValue", "$.input.initialValue"),
    );
    let definition = runtime.executor().create_definition(definition).await.unwrap();

    let instance = runtime
        .executor()
        .start_workflow(definition.id, "BIZ-A", json!({"initialValue": 5}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    let output = instance.state.step_output("double").unwrap();
    assert_eq!(output["value"].as_f64(), Some(10.0));
}

#[tokio::test]
async fn test_fan_out_and_join() {
    let runtime = runtime();
    let definition = WorkflowDefinition::new("fan-out")
        .with_step(
            Step::script("double", "return {value: input.initialValue * 2}")
                .with_input("initialValue", "$.input.initialValue"),
        )
        .with_step(
            Step::script("plus_ten", "return input.value + 10")
                .depends_on("double")
                .with_input("value", "$.steps.double.output.value"),
        )
        .with_step(
            Step::script("times_three", "return input.value * 3")
                .depends_on("double")
                .with_input("value", "$.steps.double.output.value"),
        )
        .with_step(
            Step::script("sum", "return input.a + input.b")
                .depends_on("plus_ten")
                .depends_on("times_three")
                .with_input("a", "$.steps.plus_ten.output")
                .with_input("b", "$.steps.times_three.output"),
        );
    let definition = runtime.executor().create_definition(definition).await.unwrap();

    let instance = runtime
        .executor()
        .start_workflow(definition.id, "BIZ-B", json!({"initialValue": 5}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.state.step_output("plus_ten").unwrap().as_f64(), Some(20.0));
    assert_eq!(instance.state.step_output("times_three").unwrap().as_f64(), Some(30.0));
    assert_eq!(instance.output.as_f64(), Some(50.0));
}

#[tokio::test]
async fn test_human_approval() {
    let runtime = runtime();
    let definition = runtime
        .executor()
        .create_definition(approval_definition())
        .await
        .unwrap();

    let started = runtime
        .executor()
        .start_workflow(
            definition.id,
            "REQ-001",
            json!({"requestId": "REQ-001", "amount": 1000}),
        )
        .await
        .unwrap();
    assert_eq!(started.status, WorkflowStatus::Running);
    assert_eq!(
        started.state.latest("approve").unwrap().status,
        StepStatus::AwaitingInput
    );

    let instance = runtime
        .executor()
        .complete_human_task(
            started.id,
            "approve",
            json!({"approved": true, "comments": "Looks good!"}),
        )
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(
        instance.output,
        json!({"approved": true, "comments": "Looks good!"})
    );
}

#[tokio::test]
async fn test_business_rejection_still_completes() {
    let runtime = runtime();
    let definition = runtime
        .executor()
        .create_definition(approval_definition())
        .await
        .unwrap();
    let started = runtime
        .executor()
        .start_workflow(
            definition.id,
            "REQ-002",
            json!({"requestId": "REQ-002", "amount": 1000000}),
        )
        .await
        .unwrap();

    let instance = runtime
        .executor()
        .complete_human_task(
            started.id,
            "approve",
            json!({"approved": false, "comments": "Amount too high"}),
        )
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(
        instance.output,
        json!({"approved": false, "comments": "Amount too high"})
    );
}

#[tokio::test]
async fn test_approval_input_is_validated() {
    let runtime = runtime();
    let definition = runtime
        .executor()
        .create_definition(approval_definition())
        .await
        .unwrap();

    let err = runtime
        .executor()
        .start_workflow(definition.id, "REQ-003", json!({"amount": "lots"}))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Validation(_)));
    assert_eq!(err.violations().len(), 2);
}

#[tokio::test]
async fn test_jexl_condition_routes_steps() {
    let runtime = runtime();
    let definition = WorkflowDefinition::new("routing")
        .with_step(
            Step::script("score", "return {score: input.amount / 100}")
                .with_input("amount", "$.input.amount")
                .with_output("score", "$.output.score"),
        )
        .with_step(
            Step::task("route", "script")
                .with_kind(StepKind::Decision)
                .depends_on("score"),
        )
        .with_step(
            Step::script("escalate", "return 'manager'")
                .depends_on("route")
                .with_condition("$.variables.score > 5"),
        )
        .with_step(
            Step::script("auto", "return 'auto'")
                .depends_on("route")
                .with_condition("variables.score <= 5"),
        );
    let definition = runtime.executor().create_definition(definition).await.unwrap();

    let instance = runtime
        .executor()
        .start_workflow(definition.id, "ROUTE-1", json!({"amount": 900}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(
        instance.state.latest("escalate").unwrap().status,
        StepStatus::Completed
    );
    assert_eq!(
        instance.state.latest("auto").unwrap().status,
        StepStatus::Skipped
    );
}

#[tokio::test]
async fn test_failing_script_retries_then_fails() {
    let runtime = runtime();
    let shutdown = CancellationToken::new();
    runtime.start_background(shutdown.clone());
    let mut events = runtime.subscribe_events();

    let definition = WorkflowDefinition::new("broken").with_step(
        Step::script("broken", "input.(").with_retry(3, 10, 2.0),
    );
    let definition = runtime.executor().create_definition(definition).await.unwrap();
    let started = runtime
        .executor()
        .start_workflow(definition.id, "R-1", json!({}))
        .await
        .unwrap();

    let instance = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let instance = runtime.executor().get_instance(started.id).await.unwrap();
            if instance.status.is_terminal() {
                break instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retries finish");
    shutdown.cancel();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.state.executions_for("broken").count(), 3);
    assert!(instance.error.unwrap().contains("Script error"));

    let mut saw_failed = false;
    let mut saw_duration = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::StateChanged { entity_id, status, .. }
                if entity_id == started.id.to_string() && status == "FAILED" =>
            {
                saw_failed = true
            }
            ExecutionEvent::ExecutionDuration { .. } => saw_duration = true,
            _ => {}
        }
    }
    assert!(saw_failed);
    assert!(saw_duration);
}
