//! Plan builders.
//!
//! One builder per operation kind. Each introspects the target cluster and
//! emits the ordered step list the engine will execute. Builders share the
//! cluster prologue, the temp-instance pattern, and the hard rule that every
//! instance-scoped step names its target explicitly; the alternating
//! modify/wait structure plus that rule is what prevents accidental parallel
//! modification.

mod engine_upgrade;
mod instance_cycle;
mod instance_type;
mod storage_type;

use std::collections::BTreeSet;

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::provider::{ClusterInfo, ClusterMember, MemberRole, ProviderClient};
use crate::types::{
    OperationKind, OperationParameters, Step, WAIT_FOR_TEMP_INSTANCE, actions,
};

/// A built plan: the ordered steps plus the indices the engine must pause
/// before (operator checkpoints requested by the builder).
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub pause_before_steps: BTreeSet<usize>,
}

/// Build the plan for an operation.
///
/// Fails synchronously with `InvalidParameter` when the parameter record is
/// invalid against the live cluster (unknown excluded instances, nothing
/// left to modify, unknown target type/version).
pub async fn build_plan(
    provider: &dyn ProviderClient,
    operation_id: &str,
    kind: OperationKind,
    cluster_id: &str,
    parameters: &Value,
    max_retries: u32,
) -> Result<Plan> {
    let params = OperationParameters::parse(kind, parameters)?;
    let cluster = provider.get_cluster_info(cluster_id).await?;

    let mut plan = match params {
        OperationParameters::InstanceTypeChange(p) => {
            instance_type::build(provider, operation_id, &cluster, p).await?
        }
        OperationParameters::StorageTypeChange(p) => {
            storage_type::build(operation_id, &cluster, p)?
        }
        OperationParameters::EngineUpgrade(p) => {
            engine_upgrade::build(provider, &cluster, p).await?
        }
        OperationParameters::InstanceCycle(p) => {
            instance_cycle::build(operation_id, &cluster, p)?
        }
    };

    for step in &mut plan.steps {
        step.max_retries = max_retries;
    }
    validate_plan(&plan.steps)?;
    Ok(plan)
}

/// Deterministic name for the temporary reader created for an operation.
/// Builder and handler both derive it, so the plan can carry explicit ids
/// for the temp's failover/delete steps while the create remains idempotent.
pub fn temp_instance_name(cluster_id: &str, operation_id: &str) -> String {
    let short = &operation_id[..operation_id.len().min(8)];
    format!("{cluster_id}-maint-{short}")
}

/// Reject plans that could modify an instance without naming it, and plans
/// that put two mutations back to back for different instances.
pub fn validate_plan(steps: &[Step]) -> Result<()> {
    const INSTANCE_SCOPED: &[&str] = &[
        actions::MODIFY_INSTANCE,
        actions::DELETE_INSTANCE,
        actions::REBOOT_INSTANCE,
        actions::WAIT_INSTANCE_DELETED,
    ];
    const MUTATING: &[&str] = &[actions::MODIFY_INSTANCE, actions::REBOOT_INSTANCE];

    for (idx, step) in steps.iter().enumerate() {
        let missing_id = step.instance_id().map(str::is_empty).unwrap_or(true);
        if INSTANCE_SCOPED.contains(&step.action.as_str()) && missing_id {
            return Err(Error::InvalidParameter(format!(
                "step {idx} ({}): instance_id is required for {}",
                step.name, step.action
            )));
        }
        if step.action == actions::WAIT_INSTANCE_AVAILABLE
            && step.name != WAIT_FOR_TEMP_INSTANCE
            && missing_id
        {
            return Err(Error::InvalidParameter(format!(
                "step {idx} ({}): instance_id is required for non-temp {}",
                step.name,
                actions::WAIT_INSTANCE_AVAILABLE
            )));
        }
        if idx > 0 {
            let prev = &steps[idx - 1];
            if MUTATING.contains(&prev.action.as_str())
                && MUTATING.contains(&step.action.as_str())
                && prev.instance_id() != step.instance_id()
            {
                return Err(Error::InvalidParameter(format!(
                    "step {idx} ({}): consecutive instance mutations without an intervening wait",
                    step.name
                )));
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared construction
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn get_cluster_info_step(cluster_id: &str) -> Step {
    Step::new(
        "Get cluster info",
        format!("Snapshot the current state of cluster {cluster_id}"),
        actions::GET_CLUSTER_INFO,
    )
}

pub(crate) fn verify_cluster_step(cluster_id: &str) -> Step {
    Step::new(
        "Verify cluster state",
        format!("Re-read cluster {cluster_id} after the maintenance work"),
        actions::GET_CLUSTER_INFO,
    )
}

/// Validate exclusions against the live membership and return the members the
/// plan will touch: non-autoscaled, non-excluded, writer first.
pub(crate) fn eligible_members(
    cluster: &ClusterInfo,
    exclude: &[String],
) -> Result<Vec<ClusterMember>> {
    for excluded in exclude {
        if cluster.member(excluded).is_none() {
            return Err(Error::InvalidParameter(format!(
                "exclude_instances: '{excluded}' is not a member of cluster '{}'",
                cluster.cluster_id
            )));
        }
    }

    let mut members: Vec<ClusterMember> = cluster
        .members
        .iter()
        .filter(|m| !m.autoscaled && !exclude.contains(&m.instance_id))
        .cloned()
        .collect();

    if members.is_empty() {
        return Err(Error::InvalidParameter(format!(
            "exclude_instances: all non-autoscaled instances are excluded from cluster '{}'",
            cluster.cluster_id
        )));
    }

    members.sort_by_key(|m| m.role != MemberRole::Writer);
    Ok(members)
}

/// Temp-instance prologue: create the temporary reader at the highest
/// promotion tier, wait for it, and hand it the writer role when the real
/// writer is among the instances being modified. Returns whether a failover
/// was inserted.
pub(crate) fn push_temp_prologue(
    steps: &mut Vec<Step>,
    cluster: &ClusterInfo,
    temp_id: &str,
    temp_instance_type: &str,
    writer_included: bool,
) -> bool {
    steps.push(
        Step::new(
            "Create temp instance",
            format!("Create temporary reader {temp_id} at promotion tier 0"),
            actions::CREATE_TEMP_INSTANCE,
        )
        .with_params(json!({
            "instance_type": temp_instance_type,
        })),
    );
    steps.push(Step::new(
        WAIT_FOR_TEMP_INSTANCE,
        format!("Wait for {temp_id} to become available"),
        actions::WAIT_INSTANCE_AVAILABLE,
    ));

    if writer_included {
        steps.push(
            Step::new(
                "Fail over to temp instance",
                format!("Promote {temp_id} to writer before touching the original writer"),
                actions::FAILOVER_CLUSTER,
            )
            .with_params(json!({ "target_instance": temp_id })),
        );
        steps.push(Step::new(
            "Wait for cluster after failover",
            format!("Wait for cluster {} to settle", cluster.cluster_id),
            actions::WAIT_CLUSTER_AVAILABLE,
        ));
    }
    writer_included
}

/// Temp-instance epilogue: fail back to the original writer when a failover
/// happened, then remove the temporary reader.
pub(crate) fn push_temp_epilogue(
    steps: &mut Vec<Step>,
    cluster: &ClusterInfo,
    original_writer: Option<&str>,
    temp_id: &str,
    failover_performed: bool,
) {
    if failover_performed {
        if let Some(writer) = original_writer {
            steps.push(
                Step::new(
                    "Fail back to original writer",
                    format!("Return the writer role to {writer}"),
                    actions::FAILOVER_CLUSTER,
                )
                .with_params(json!({ "target_instance": writer })),
            );
            steps.push(Step::new(
                "Wait for cluster after failback",
                format!("Wait for cluster {} to settle", cluster.cluster_id),
                actions::WAIT_CLUSTER_AVAILABLE,
            ));
        }
    }
    steps.push(
        Step::new(
            "Delete temp instance",
            format!("Remove temporary reader {temp_id}"),
            actions::DELETE_INSTANCE,
        )
        .with_params(json!({ "instance_id": temp_id })),
    );
    steps.push(
        Step::new(
            "Wait for temp instance deletion",
            format!("Wait until {temp_id} no longer exists"),
            actions::WAIT_INSTANCE_DELETED,
        )
        .with_params(json!({ "instance_id": temp_id })),
    );
}
