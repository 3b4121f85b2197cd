//! Instance cycle plan.
//!
//! Reboots every non-excluded member to apply pending changes. With the temp
//! prologue in place the original writer is a reader by the time it reboots,
//! so the cycle never bounces the active writer.

use serde_json::json;

use crate::error::Result;
use crate::plan::{
    Plan, eligible_members, get_cluster_info_step, push_temp_epilogue, push_temp_prologue,
    temp_instance_name, verify_cluster_step,
};
use crate::provider::{ClusterInfo, MemberRole};
use crate::types::{InstanceCycleParams, Step, actions};

pub(super) fn build(
    operation_id: &str,
    cluster: &ClusterInfo,
    params: InstanceCycleParams,
) -> Result<Plan> {
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

    // eligible_members orders the original writer first.
    for member in &members {
        let id = &member.instance_id;
        steps.push(
            Step::new(
                format!("Reboot instance {id}"),
                format!("Reboot {id} to apply pending changes"),
                actions::REBOOT_INSTANCE,
            )
            .with_params(json!({ "instance_id": id })),
        );
        steps.push(
            Step::new(
                format!("Wait for instance {id}"),
                format!("Wait for {id} to come back available after the reboot"),
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
