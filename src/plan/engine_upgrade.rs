//! Engine major-version upgrade plan (blue/green path).
//!
//! The provider stages an upgraded clone of the cluster, the plan swaps it
//! in with a short switchover, and the stale `-old1` resources are cleaned
//! up afterwards. The riskiest checkpoints (taking proxies offline, the
//! switchover itself, deleting old resources) auto-pause for operator
//! confirmation unless the caller opted out individually.

use serde_json::{Value, json};
use tracing::warn;

use crate::error::{Error, Result};
use crate::plan::{Plan, get_cluster_info_step, verify_cluster_step};
use crate::provider::{ClusterInfo, ProviderClient};
use crate::types::{EngineUpgradeParams, Step, actions};

pub(super) async fn build(
    provider: &dyn ProviderClient,
    cluster: &ClusterInfo,
    params: EngineUpgradeParams,
) -> Result<Plan> {
    if params.target_engine_version.is_empty() {
        return Err(Error::InvalidParameter(
            "target_engine_version: must not be empty".into(),
        ));
    }

    match provider
        .get_valid_upgrade_targets(&cluster.engine, &cluster.engine_version)
        .await
    {
        Ok(targets) if !targets.is_empty() && !targets.contains(&params.target_engine_version) => {
            return Err(Error::InvalidParameter(format!(
                "target_engine_version: '{}' is not a valid upgrade target from {} {}",
                params.target_engine_version, cluster.engine, cluster.engine_version
            )));
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "Could not list upgrade targets; skipping check");
        }
    }

    let mut prepare = json!({
        "target_engine_version": params.target_engine_version,
    });
    if let Some(group) = &params.db_cluster_parameter_group_name {
        prepare["db_cluster_parameter_group_name"] = Value::from(group.clone());
    }
    if let Some(group) = &params.db_instance_parameter_group_name {
        prepare["db_instance_parameter_group_name"] = Value::from(group.clone());
    }

    let mut create_bg = json!({
        "target_engine_version": params.target_engine_version,
    });
    let mut switchover = json!({});
    if let Some(timeout) = params.switchover_timeout {
        create_bg["switchover_timeout"] = Value::from(timeout);
        switchover["switchover_timeout"] = Value::from(timeout);
    }

    let mut steps = vec![
        get_cluster_info_step(&cluster.cluster_id),
        Step::new(
            "Prepare parameter groups",
            format!(
                "Resolve or create parameter groups for the {} {} family",
                cluster.engine, params.target_engine_version
            ),
            actions::PREPARE_PARAMETER_GROUP,
        )
        .with_params(prepare),
        Step::new(
            "Wait for cluster",
            format!("Ensure cluster {} is stable before staging", cluster.cluster_id),
            actions::WAIT_CLUSTER_AVAILABLE,
        ),
    ];

    if !params.skip_proxy_retarget {
        steps.push(Step::new(
            "Validate proxy health",
            "Check every proxy fronting the cluster is healthy",
            actions::VALIDATE_PROXY_HEALTH,
        ));
        steps.push(Step::new(
            "Deregister proxy targets",
            "Detach proxies from the cluster ahead of the switchover",
            actions::DEREGISTER_PROXY_TARGETS,
        ));
    }

    steps.push(
        Step::new(
            "Create blue/green deployment",
            format!(
                "Stage an upgraded clone of {} at {}",
                cluster.cluster_id, params.target_engine_version
            ),
            actions::CREATE_BLUE_GREEN_DEPLOYMENT,
        )
        .with_params(create_bg),
    );
    steps.push(Step::new(
        "Wait for blue/green deployment",
        "Wait for the staged clone to finish provisioning and upgrading",
        actions::WAIT_BLUE_GREEN_AVAILABLE,
    ));
    steps.push(
        Step::new(
            "Switch over",
            "Swap the upgraded clone in as the live cluster",
            actions::SWITCHOVER_BLUE_GREEN,
        )
        .with_params(switchover),
    );

    if !params.skip_proxy_retarget {
        steps.push(Step::new(
            "Register proxy targets",
            "Reattach proxies to the upgraded cluster",
            actions::REGISTER_PROXY_TARGETS,
        ));
    }

    steps.push(Step::new(
        "Clean up blue/green deployment",
        "Delete the deployment record and the -old1 resources left behind",
        actions::CLEANUP_BLUE_GREEN,
    ));
    steps.push(verify_cluster_step(&cluster.cluster_id));

    let mut pause_before_steps = std::collections::BTreeSet::new();
    let mut pause_on = |action: &str, enabled: bool| {
        if enabled {
            if let Some(idx) = steps.iter().position(|s| s.action == action) {
                pause_before_steps.insert(idx);
            }
        }
    };
    pause_on(
        actions::DEREGISTER_PROXY_TARGETS,
        params.pause_before_proxy_deregister && !params.skip_proxy_retarget,
    );
    pause_on(actions::SWITCHOVER_BLUE_GREEN, params.pause_before_switchover);
    pause_on(actions::CLEANUP_BLUE_GREEN, params.pause_before_cleanup);

    Ok(Plan {
        steps,
        pause_before_steps,
    })
}
