//! Step-at-a-time executor tests: one-shot step execution, single-check
//! polling of waits, auto-pause surfacing, and retry bookkeeping, all
//! without a background task.

mod common;

use common::*;
use serde_json::json;

use rds_maintenance::error::Error;
use rds_maintenance::executor::StepExecutor;
use rds_maintenance::types::{
    InterventionAction, Operation, OperationKind, OperationState, Step, StepState, actions,
};

fn custom_op(cluster_id: &str, steps: Vec<Step>) -> Operation {
    let mut op = Operation::new(
        OperationKind::InstanceCycle,
        cluster_id,
        "eu-central-1",
        json!({}),
    );
    op.steps = steps;
    op
}

#[tokio::test]
async fn test_step_at_a_time_drives_a_plan_with_a_wait() {
    let mut info = three_node_cluster("db-main");
    info.members[1].status = "modifying".to_string();
    let provider = FakeProvider::with_cluster(info);
    let engine = engine_with(provider.clone());
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![
                Step::new("Get cluster info", "Snapshot", actions::GET_CLUSTER_INFO),
                Step::new("Wait for instance db-main-2", "Wait", actions::WAIT_INSTANCE_AVAILABLE)
                    .with_params(json!({"instance_id": "db-main-2"})),
                Step::new("Verify cluster state", "Re-read", actions::GET_CLUSTER_INFO),
            ],
        ))
        .await
        .unwrap();
    executor.start(&op.id).await.unwrap();

    // Step 0 runs synchronously and hands control back.
    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.can_continue);
    assert_eq!(result.step_index, 0);

    // Step 1 is a wait: a single check, then needs_wait with the condition.
    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.needs_wait);
    assert!(result.wait_condition.as_ref().unwrap().contains("db-main-2"));
    let current = engine.get_operation(&op.id).await.unwrap();
    assert_eq!(current.steps[1].state, StepState::Waiting);

    // Polling while the instance is still modifying changes nothing.
    let poll = executor.poll_current_step(&op.id).await.unwrap();
    assert!(!poll.ready);
    assert!(!poll.completed);

    // Once the instance settles, one poll completes the step and advances.
    provider.state.lock().unwrap().clusters.get_mut("db-main").unwrap().members[1].status =
        "available".to_string();
    let poll = executor.poll_current_step(&op.id).await.unwrap();
    assert!(poll.ready);
    assert!(poll.can_continue);

    // The final step closes out the operation.
    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.completed);
    let done = engine.get_operation(&op.id).await.unwrap();
    assert_eq!(done.state, OperationState::Completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_executor_surfaces_auto_pause() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    let engine = engine_with(provider);
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![
                Step::new("Get cluster info", "Snapshot", actions::GET_CLUSTER_INFO),
                Step::new("Reboot instance db-main-2", "Bounce", actions::REBOOT_INSTANCE)
                    .with_params(json!({"instance_id": "db-main-2"})),
            ],
        ))
        .await
        .unwrap();
    engine.set_pause_before_steps(&op.id, &[1]).await.unwrap();
    executor.start(&op.id).await.unwrap();

    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.can_continue);

    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.needs_intervention);
    assert!(result.pause_reason.as_ref().unwrap().contains("Auto-pause"));

    // Resuming through the executor never spawns a task; the caller drives.
    executor
        .resume(&op.id, InterventionAction::Continue, None)
        .await
        .unwrap();
    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.completed);
}

#[tokio::test]
async fn test_executor_retry_bookkeeping() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    provider.fail_next("reboot_instance", 1);
    let engine = engine_with(provider);
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![
                Step::new("Reboot instance db-main-2", "Bounce", actions::REBOOT_INSTANCE)
                    .with_params(json!({"instance_id": "db-main-2"})),
            ],
        ))
        .await
        .unwrap();
    executor.start(&op.id).await.unwrap();

    // First attempt fails but retries remain: the caller may re-invoke.
    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.can_continue);
    assert!(result.error.as_ref().unwrap().contains("injected failure"));
    let current = engine.get_operation(&op.id).await.unwrap();
    assert_eq!(current.steps[0].retry_count, 1);
    assert_eq!(current.steps[0].state, StepState::Pending);

    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.completed);
}

#[tokio::test]
async fn test_executor_reports_exhausted_failure() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    provider.fail_next("reboot_instance", 10);
    let engine = engine_with(provider);
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![
                Step::new("Reboot instance db-main-2", "Bounce", actions::REBOOT_INSTANCE)
                    .with_params(json!({"instance_id": "db-main-2"}))
                    .with_max_retries(0),
            ],
        ))
        .await
        .unwrap();
    executor.start(&op.id).await.unwrap();

    let result = executor.execute_current_step(&op.id).await.unwrap();
    assert!(result.failed);
    assert!(result.pause_reason.as_ref().unwrap().contains("Step failed"));

    let paused = engine.get_operation(&op.id).await.unwrap();
    assert_eq!(paused.state, OperationState::Paused);
    assert_eq!(paused.steps[0].state, StepState::Failed);
}

#[tokio::test]
async fn test_poll_requires_a_waiting_step() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    let engine = engine_with(provider);
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![Step::new("Get cluster info", "Snapshot", actions::GET_CLUSTER_INFO)],
        ))
        .await
        .unwrap();
    executor.start(&op.id).await.unwrap();

    let err = executor.poll_current_step(&op.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_executor_requires_running_operation() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    let engine = engine_with(provider);
    let executor = StepExecutor::new(engine.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![Step::new("Get cluster info", "Snapshot", actions::GET_CLUSTER_INFO)],
        ))
        .await
        .unwrap();

    let err = executor.execute_current_step(&op.id).await.unwrap_err();
    assert!(matches!(err, Error::OperationNotRunning(_)));
}
