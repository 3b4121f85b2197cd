//! Handler-level tests driven through the engine with hand-built plans:
//! parameter-group migration, blue/green adoption and switchover
//! idempotency, cleanup inference, proxy registration shortcuts, and the
//! temp-wait sentinel resolution.

mod common;

use common::*;
use serde_json::json;

use rds_maintenance::provider::{BlueGreenDeployment, BlueGreenTask, Parameter, ProxyTarget};
use rds_maintenance::types::{
    Operation, OperationKind, OperationState, Step, WAIT_FOR_TEMP_INSTANCE, actions,
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

async fn run_to_completion(
    provider: std::sync::Arc<FakeProvider>,
    op: Operation,
) -> (rds_maintenance::engine::Engine, Operation) {
    let engine = engine_with(provider);
    let op = engine.register_operation(op).await.unwrap();
    engine.start_operation(&op.id).await.unwrap();
    let done = wait_for_state(&engine, &op.id, OperationState::Completed).await;
    (engine, done)
}

// ═══════════════════════════════════════════════════════════════════════════
// prepare_parameter_group
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_prepare_parameter_group_migrates_custom_group() {
    let mut info = three_node_cluster("db-main");
    info.parameter_group = "myapp-cluster-params".to_string();
    let provider = FakeProvider::with_cluster(info);
    provider.state.lock().unwrap().parameter_groups.insert(
        "myapp-cluster-params".to_string(),
        vec![
            Parameter {
                name: "max_connections".to_string(),
                value: "500".to_string(),
                apply_method: "pending-reboot".to_string(),
            },
            Parameter {
                name: "log_statement".to_string(),
                value: "ddl".to_string(),
                apply_method: "immediate".to_string(),
            },
        ],
    );

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new(
                    "Prepare parameter groups",
                    "Resolve groups for the target family",
                    actions::PREPARE_PARAMETER_GROUP,
                )
                .with_params(json!({"target_engine_version": "15.4"})),
                Step::new(
                    "Create blue/green deployment",
                    "Stage the upgraded clone",
                    actions::CREATE_BLUE_GREEN_DEPLOYMENT,
                )
                .with_params(json!({"target_engine_version": "15.4"})),
            ],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(
        result["cluster_parameter_group"],
        "myapp-cluster-params-aurora-postgresql15"
    );
    // The default instance group maps to the target family default.
    assert_eq!(
        result["instance_parameter_group"],
        "default.aurora-postgresql15"
    );
    assert_eq!(result["skipped_parameters"].as_array().unwrap().len(), 0);

    // The pending creation step was patched with the resolved names.
    assert_eq!(
        done.steps[1].param_str("db_cluster_parameter_group_name"),
        Some("myapp-cluster-params-aurora-postgresql15")
    );

    // The migrated group received the custom parameters.
    let state = provider.state.lock().unwrap();
    let migrated = &state.parameter_groups["myapp-cluster-params-aurora-postgresql15"];
    assert_eq!(migrated.len(), 2);
}

#[tokio::test]
async fn test_prepare_parameter_group_skips_rejected_parameters() {
    let mut info = three_node_cluster("db-main");
    info.parameter_group = "myapp-cluster-params".to_string();
    let provider = FakeProvider::with_cluster(info);
    provider.state.lock().unwrap().parameter_groups.insert(
        "myapp-cluster-params".to_string(),
        vec![
            Parameter {
                name: "bad_parameter".to_string(),
                value: "nope".to_string(),
                apply_method: "immediate".to_string(),
            },
            Parameter {
                name: "log_statement".to_string(),
                value: "ddl".to_string(),
                apply_method: "immediate".to_string(),
            },
        ],
    );
    // The batch fails once, then the first one-by-one attempt fails: only
    // that parameter is skipped, the rest still migrate.
    provider.fail_next("modify_cluster_parameter_group", 2);

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new(
                    "Prepare parameter groups",
                    "Resolve groups for the target family",
                    actions::PREPARE_PARAMETER_GROUP,
                )
                .with_params(json!({"target_engine_version": "15.4"})),
            ],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    let skipped: Vec<&str> = result["skipped_parameters"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(skipped, vec!["bad_parameter"]);

    let state = provider.state.lock().unwrap();
    let migrated = &state.parameter_groups["myapp-cluster-params-aurora-postgresql15"];
    assert_eq!(migrated.len(), 1);
    assert_eq!(migrated[0].name, "log_statement");
}

// ═══════════════════════════════════════════════════════════════════════════
// Blue/green idempotency
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_create_blue_green_adopts_existing_deployment() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    provider.state.lock().unwrap().deployments.insert(
        "bgd-existing".to_string(),
        BlueGreenDeployment {
            identifier: "bgd-existing".to_string(),
            name: "bg-db-main-15-4".to_string(),
            status: "AVAILABLE".to_string(),
            source: "arn:aws:rds:eu-central-1:123456789012:cluster:db-main".to_string(),
            target: None,
            tasks: vec![BlueGreenTask {
                name: "CREATING_GREEN_ENVIRONMENT".to_string(),
                status: "COMPLETED".to_string(),
            }],
            switchover_details: Vec::new(),
        },
    );

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new(
                    "Create blue/green deployment",
                    "Stage the upgraded clone",
                    actions::CREATE_BLUE_GREEN_DEPLOYMENT,
                )
                .with_params(json!({"target_engine_version": "15.4"})),
            ],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(result["identifier"], "bgd-existing");
    assert_eq!(result["adopted"], true);
    assert_eq!(provider.calls_for("create_blue_green_deployment"), 0);
}

#[tokio::test]
async fn test_switchover_already_completed_is_a_noop() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    provider.state.lock().unwrap().deployments.insert(
        "bgd-1".to_string(),
        BlueGreenDeployment {
            identifier: "bgd-1".to_string(),
            name: "bg-db-main-15-4".to_string(),
            status: "SWITCHOVER_COMPLETED".to_string(),
            source: "arn:aws:rds:eu-central-1:123456789012:cluster:db-main".to_string(),
            target: None,
            tasks: Vec::new(),
            switchover_details: Vec::new(),
        },
    );

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new("Switch over", "Swap the clone in", actions::SWITCHOVER_BLUE_GREEN)
                    .with_params(json!({"identifier": "bgd-1"})),
            ],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(result["status"], "SWITCHOVER_COMPLETED");
    assert_eq!(provider.calls_for("switchover_blue_green_deployment"), 0);
}

#[tokio::test]
async fn test_cleanup_infers_old_resources_from_cluster_id() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    // The -old1 environment a previous switchover left behind.
    provider.state.lock().unwrap().clusters.insert(
        "db-main-old1".to_string(),
        cluster(
            "db-main-old1",
            vec![
                member("db-main-1-old1", rds_maintenance::provider::MemberRole::Writer),
                member("db-main-2-old1", rds_maintenance::provider::MemberRole::Reader),
            ],
        ),
    );

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new("Get cluster info", "Snapshot", actions::GET_CLUSTER_INFO),
                Step::new(
                    "Clean up blue/green deployment",
                    "Remove the stale environment",
                    actions::CLEANUP_BLUE_GREEN,
                ),
            ],
        ),
    )
    .await;

    // With no recorded switchover details and no deployment, the handler
    // falls back to the naming convention.
    let result = done.steps[1].result.as_ref().unwrap();
    assert_eq!(result["deleted_cluster"], "db-main-old1");
    assert!(!provider.state.lock().unwrap().clusters.contains_key("db-main-old1"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Proxies
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_register_proxy_targets_short_circuits_when_registered() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    {
        let mut state = provider.state.lock().unwrap();
        state.proxies.insert(
            "db-main".to_string(),
            vec![rds_maintenance::provider::ProxyInfo {
                name: "proxy-1".to_string(),
                status: "available".to_string(),
            }],
        );
        state.proxy_targets.insert(
            "proxy-1".to_string(),
            vec![
                ProxyTarget {
                    id: "db-main".to_string(),
                    target_type: "TRACKED_CLUSTER".to_string(),
                    health: "AVAILABLE".to_string(),
                },
                ProxyTarget {
                    id: "db-main-1".to_string(),
                    target_type: "RDS_INSTANCE".to_string(),
                    health: "AVAILABLE".to_string(),
                },
            ],
        );
    }

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![Step::new(
                "Register proxy targets",
                "Reattach proxies",
                actions::REGISTER_PROXY_TARGETS,
            )],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(result["already_registered"], true);
    assert_eq!(provider.calls_for("register_proxy_targets"), 0);
}

#[tokio::test]
async fn test_retarget_proxies_alias_registers() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    provider.state.lock().unwrap().proxies.insert(
        "db-main".to_string(),
        vec![rds_maintenance::provider::ProxyInfo {
            name: "proxy-1".to_string(),
            status: "available".to_string(),
        }],
    );

    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![Step::new(
                "Retarget proxies",
                "Reattach proxies (deprecated alias)",
                actions::RETARGET_PROXIES,
            )],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(result["already_registered"], false);
    assert_eq!(provider.calls_for("register_proxy_targets"), 1);

    let state = provider.state.lock().unwrap();
    let targets = &state.proxy_targets["proxy-1"];
    assert!(targets.iter().any(|t| t.target_type == "TRACKED_CLUSTER"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Temp-wait sentinel and failover shortcuts
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_temp_wait_sentinel_without_create_step_fails() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    let engine = engine_with(provider);

    let mut op = custom_op(
        "db-main",
        vec![
            Step::new(
                WAIT_FOR_TEMP_INSTANCE,
                "Wait for the temporary reader",
                actions::WAIT_INSTANCE_AVAILABLE,
            )
            .with_max_retries(0),
        ],
    );
    op.wait_timeout_secs = 1;
    let op = engine.register_operation(op).await.unwrap();
    engine.start_operation(&op.id).await.unwrap();

    let paused = wait_for_state(&engine, &op.id, OperationState::Paused).await;
    assert!(
        paused.steps[0]
            .error
            .as_ref()
            .unwrap()
            .contains("create_temp_instance")
    );
}

#[tokio::test]
async fn test_failover_to_transitional_target_is_refused() {
    let mut info = three_node_cluster("db-main");
    info.members[1].status = "rebooting".to_string();
    let provider = FakeProvider::with_cluster(info);
    let engine = engine_with(provider.clone());

    let op = engine
        .register_operation(custom_op(
            "db-main",
            vec![
                Step::new("Fail over to db-main-2", "Promote", actions::FAILOVER_CLUSTER)
                    .with_params(json!({"target_instance": "db-main-2"}))
                    .with_max_retries(0),
            ],
        ))
        .await
        .unwrap();
    engine.start_operation(&op.id).await.unwrap();

    // A non-available target fails immediately, without polling.
    let paused = wait_for_state(&engine, &op.id, OperationState::Paused).await;
    let error = paused.steps[0].error.as_ref().unwrap();
    assert!(error.contains("cannot fail over"), "error: {error}");
    assert!(error.contains("rebooting"));
    assert_eq!(provider.calls_for("failover_cluster"), 0);
}

#[tokio::test]
async fn test_failover_to_current_writer_is_skipped() {
    let provider = FakeProvider::with_cluster(three_node_cluster("db-main"));
    let (_engine, done) = run_to_completion(
        provider.clone(),
        custom_op(
            "db-main",
            vec![
                Step::new("Fail over to db-main-1", "Promote", actions::FAILOVER_CLUSTER)
                    .with_params(json!({"target_instance": "db-main-1"})),
            ],
        ),
    )
    .await;

    let result = done.steps[0].result.as_ref().unwrap();
    assert_eq!(result["status"], "skipped");
    assert_eq!(provider.calls_for("failover_cluster"), 0);
}
