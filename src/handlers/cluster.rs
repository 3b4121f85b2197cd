//! Cluster-scoped handlers: snapshots of cluster state, cluster-wide waits,
//! cluster modification, snapshots, and failover.

use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, HandlerOutcome, required_param, result_str, wait};
use crate::provider::{MemberRole, ModifyClusterRequest, ProviderError};
use crate::status;
use crate::types::{Operation, actions};

/// Fetch the cluster snapshot and store it in the step result for later
/// steps to read.
pub(super) async fn get_cluster_info(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let info = ctx.provider.get_cluster_info(&op.cluster_id).await?;
    op.steps[idx].result = Some(serde_json::to_value(&info)?);
    Ok(HandlerOutcome::Done)
}

/// Wait until the cluster and every live member are available.
///
/// Stopped and deleting members are ignored; a member in an error status
/// aborts the wait.
pub(super) async fn wait_cluster_available(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let provider = ctx.provider.clone();
    let cluster_id = op.cluster_id.clone();
    let condition = format!("Cluster {cluster_id} and all members available");
    let step = &mut op.steps[idx];

    wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let cluster_id = cluster_id.clone();
        async move {
            let info = provider.get_cluster_info(&cluster_id).await?;
            if status::is_error(&info.status) {
                return Err(Error::StepFailed(format!(
                    "cluster {cluster_id} is in error status '{}'",
                    info.status
                )));
            }
            if !status::is_available(&info.status) {
                return Ok(false);
            }
            for member in &info.members {
                if status::is_stopped(&member.status) || status::is_deleting(&member.status) {
                    continue;
                }
                if status::is_error(&member.status) {
                    return Err(Error::StepFailed(format!(
                        "instance {} is in error status '{}'",
                        member.instance_id, member.status
                    )));
                }
                if !status::is_available(&member.status) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    })
    .await
}

/// Apply engine version / parameter group changes with `apply_immediately`.
pub(super) async fn modify_cluster(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let step = &op.steps[idx];
    let engine_version = step.param_str("engine_version").map(str::to_string);
    let parameter_group = step
        .param_str("parameter_group")
        .or_else(|| step.param_str("db_cluster_parameter_group_name"))
        .map(str::to_string);

    let req = ModifyClusterRequest {
        cluster_id: op.cluster_id.clone(),
        allow_major_version_upgrade: engine_version.is_some(),
        engine_version,
        parameter_group,
        apply_immediately: true,
    };
    ctx.provider.modify_cluster(&req).await?;
    op.steps[idx].result = Some(json!({ "modified": true }));
    Ok(HandlerOutcome::Done)
}

/// Create a cluster snapshot named for this operation. Re-runs adopt an
/// existing snapshot of the same name.
pub(super) async fn create_snapshot(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let short = &op.id[..op.id.len().min(8)];
    let snapshot_id = op.steps[idx]
        .param_str("snapshot_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-maint-{short}", op.cluster_id));

    match ctx
        .provider
        .create_cluster_snapshot(&op.cluster_id, &snapshot_id)
        .await
    {
        Ok(()) => {}
        Err(ProviderError::AlreadyExists(_)) => {
            info!(snapshot_id = %snapshot_id, "Snapshot already exists; adopting");
        }
        Err(e) => return Err(e.into()),
    }
    op.steps[idx].result = Some(json!({ "snapshot_id": snapshot_id }));
    Ok(HandlerOutcome::Done)
}

pub(super) async fn wait_snapshot_available(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let snapshot_id = op.steps[idx]
        .param_str("snapshot_id")
        .map(str::to_string)
        .or_else(|| result_str(op.find_completed_result(actions::CREATE_SNAPSHOT), "snapshot_id"))
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "snapshot_id: required for {}",
                actions::WAIT_SNAPSHOT_AVAILABLE
            ))
        })?;

    let provider = ctx.provider.clone();
    let condition = format!("Snapshot {snapshot_id} available");
    let id = snapshot_id.clone();
    let step = &mut op.steps[idx];

    wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let id = id.clone();
        async move {
            match provider.get_snapshot_status(&id).await? {
                Some(ref s) if status::is_available(s) => Ok(true),
                Some(ref s) if status::is_error(s) => Err(Error::StepFailed(format!(
                    "snapshot {id} is in error status '{s}'"
                ))),
                _ => Ok(false),
            }
        }
    })
    .await
}

/// Fail the cluster over to an explicit target instance, then wait for the
/// target to hold the writer role.
///
/// Safe to re-run: a target that is already the writer short-circuits to a
/// skipped result. Any other target must be available.
pub(super) async fn failover_cluster(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let target = required_param(&op.steps[idx], "target_instance")?.to_string();

    let info = ctx.provider.get_cluster_info(&op.cluster_id).await?;
    let member = info
        .member(&target)
        .ok_or_else(|| Error::InstanceNotFound(target.clone()))?;

    if member.role == MemberRole::Writer {
        op.steps[idx].result = Some(json!({ "status": "skipped" }));
        return Ok(HandlerOutcome::Done);
    }
    if !status::can_failover(&member.status) {
        return Err(Error::InvalidState(format!(
            "cannot fail over to {target} in status '{}'",
            member.status
        )));
    }
    info!(cluster_id = %op.cluster_id, target = %target, "Initiating failover");
    ctx.provider.failover_cluster(&op.cluster_id, &target).await?;

    let provider = ctx.provider.clone();
    let cluster_id = op.cluster_id.clone();
    let target_for_check = target.clone();
    let condition = format!("{target} holds the writer role");
    let step = &mut op.steps[idx];

    let outcome = wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let cluster_id = cluster_id.clone();
        let target = target_for_check.clone();
        async move {
            let info = provider.get_cluster_info(&cluster_id).await?;
            Ok(info
                .member(&target)
                .map(|m| m.role == MemberRole::Writer)
                .unwrap_or(false))
        }
    })
    .await?;

    if outcome == HandlerOutcome::Done {
        op.steps[idx].result = Some(json!({ "status": "completed", "target": target }));
    }
    Ok(outcome)
}
