//! Instance type change plan.
//!
//! Sequentially moves every non-autoscaled, non-excluded member to the
//! target instance type, shielding the cluster behind a temporary reader
//! unless the caller opted out.

use serde_json::json;
use tracing::warn;

use crate::error::{Error, Result};
use crate::plan::{
    Plan, eligible_members, get_cluster_info_step, push_temp_epilogue, push_temp_prologue,
    temp_instance_name, verify_cluster_step,
};
use crate::provider::{ClusterInfo, MemberRole, ProviderClient};
use crate::types::{InstanceTypeChangeParams, Step, actions};

pub(super) async fn build(
    provider: &dyn ProviderClient,
    operation_id: &str,
    cluster: &ClusterInfo,
    params: InstanceTypeChangeParams,
) -> Result<Plan> {
    if params.target_instance_type.is_empty() {
        return Err(Error::InvalidParameter(
            "target_instance_type: must not be empty".into(),
        ));
    }

    // Best-effort catalog check; an empty or failed lookup does not block.
    match provider
        .get_orderable_instance_types(&cluster.engine, &cluster.engine_version)
        .await
    {
        Ok(types) if !types.is_empty() && !types.contains(&params.target_instance_type) => {
            return Err(Error::InvalidParameter(format!(
                "target_instance_type: '{}' is not orderable for {} {}",
                params.target_instance_type, cluster.engine, cluster.engine_version
            )));
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "Could not list orderable instance types; skipping check");
        }
    }

    let members = eligible_members(cluster, &params.exclude_instances)?;
    let writer_included = members.iter().any(|m| m.role == MemberRole::Writer);
    let original_writer = cluster.writer().map(|w| w.instance_id.clone());
    let temp_id = temp_instance_name(&cluster.cluster_id, operation_id);

    let mut steps = vec![get_cluster_info_step(&cluster.cluster_id)];

    let failover_performed = if params.skip_temp_instance {
        false
    } else {
        push_temp_prologue(
            &mut steps,
            cluster,
            &temp_id,
            &params.target_instance_type,
            writer_included,
        )
    };

    for member in &members {
        let id = &member.instance_id;
        steps.push(
            Step::new(
                format!("Modify instance {id}"),
                format!(
                    "Change {id} from {} to {}",
                    member.instance_type, params.target_instance_type
                ),
                actions::MODIFY_INSTANCE,
            )
            .with_params(json!({
                "instance_id": id,
                "instance_type": params.target_instance_type,
            })),
        );
        steps.push(
            Step::new(
                format!("Wait for instance {id}"),
                format!("Wait for {id} to come back available on the new type"),
                actions::WAIT_INSTANCE_AVAILABLE,
            )
            .with_params(json!({ "instance_id": id })),
        );
    }

    if !params.skip_temp_instance {
        push_temp_epilogue(
            &mut steps,
            cluster,
            original_writer.as_deref(),
            &temp_id,
            failover_performed,
        );
    }
    steps.push(verify_cluster_step(&cluster.cluster_id));

    Ok(Plan {
        steps,
        pause_before_steps: Default::default(),
    })
}
