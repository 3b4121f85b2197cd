//! Storage type change plan.
//!
//! Same shape as the instance type change: temp-instance shield, then one
//! modify/wait pair per member. Storage changes keep each member's instance
//! type; the temp reader is created at the writer's current type.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::plan::{
    Plan, eligible_members, get_cluster_info_step, push_temp_epilogue, push_temp_prologue,
    temp_instance_name, verify_cluster_step,
};
use crate::provider::{ClusterInfo, MemberRole};
use crate::types::{Step, StorageTypeChangeParams, actions};

pub(super) fn build(
    operation_id: &str,
    cluster: &ClusterInfo,
    params: StorageTypeChangeParams,
) -> Result<Plan> {
    if params.target_storage_type.is_empty() {
        return Err(Error::InvalidParameter(
            "target_storage_type: must not be empty".into(),
        ));
    }

    let members = eligible_members(cluster, &params.exclude_instances)?;
    let writer_included = members.iter().any(|m| m.role == MemberRole::Writer);
    let original_writer = cluster.writer().map(|w| w.instance_id.clone());
    let temp_type = cluster
        .writer()
        .map(|w| w.instance_type.clone())
        .unwrap_or_else(|| members[0].instance_type.clone());
    let temp_id = temp_instance_name(&cluster.cluster_id, operation_id);

    let mut steps = vec![get_cluster_info_step(&cluster.cluster_id)];

    let failover_performed = if params.skip_temp_instance {
        false
    } else {
        push_temp_prologue(&mut steps, cluster, &temp_id, &temp_type, writer_included)
    };

    for member in &members {
        let id = &member.instance_id;
        let mut modify = json!({
            "instance_id": id,
            "storage_type": params.target_storage_type,
        });
        if let Some(iops) = params.iops {
            modify["iops"] = Value::from(iops);
        }
        if let Some(throughput) = params.storage_throughput {
            modify["storage_throughput"] = Value::from(throughput);
        }
        steps.push(
            Step::new(
                format!("Modify instance {id}"),
                format!(
                    "Change {id} storage from {} to {}",
                    member.storage_type, params.target_storage_type
                ),
                actions::MODIFY_INSTANCE,
            )
            .with_params(modify),
        );
        steps.push(
            Step::new(
                format!("Wait for instance {id}"),
                format!("Wait for {id} to come back available on the new storage"),
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
