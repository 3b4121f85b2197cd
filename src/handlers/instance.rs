//! Instance-scoped handlers.
//!
//! Every handler here requires an explicit `instance_id` parameter, with one
//! exception: the temp instance's availability wait (recognized by its
//! sentinel step name) resolves the id from the `create_temp_instance`
//! result. That rule is the safeguard against accidentally modifying the
//! wrong member.

use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::handlers::{
    HandlerContext, HandlerOutcome, desired_config_for, required_param, result_str, wait,
};
use crate::plan::temp_instance_name;
use crate::provider::{CreateInstanceRequest, MemberRole, ModifyInstanceRequest, ProviderError};
use crate::status;
use crate::types::{Operation, WAIT_FOR_TEMP_INSTANCE, actions};

/// Create the temporary reader at promotion tier 0.
///
/// The id is synthesized deterministically from (cluster, operation), so a
/// retry after a partial attempt adopts the instance instead of creating a
/// second one.
pub(super) async fn create_temp_instance(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let temp_id = temp_instance_name(&op.cluster_id, &op.id);
    let info = ctx.provider.get_cluster_info(&op.cluster_id).await?;

    let instance_type = op.steps[idx]
        .param_str("instance_type")
        .map(str::to_string)
        .or_else(|| info.writer().map(|w| w.instance_type.clone()))
        .ok_or_else(|| {
            Error::InvalidState(format!(
                "cluster {} has no writer to derive an instance type from",
                op.cluster_id
            ))
        })?;

    let req = CreateInstanceRequest {
        cluster_id: op.cluster_id.clone(),
        instance_id: temp_id.clone(),
        instance_type,
        engine: info.engine.clone(),
        promotion_tier: 0,
        tags: [
            ("created-by".to_string(), "rds-maintenance".to_string()),
            ("operation-id".to_string(), op.id.clone()),
        ]
        .into_iter()
        .collect(),
    };

    match ctx.provider.create_cluster_instance(&req).await {
        Ok(()) => info!(instance_id = %temp_id, "Created temp instance"),
        Err(ProviderError::AlreadyExists(_)) => {
            info!(instance_id = %temp_id, "Temp instance already exists; adopting");
        }
        Err(e) => return Err(e.into()),
    }

    op.steps[idx].result = Some(json!({
        "instance_id": temp_id,
        "created_by": "rds-maintenance",
    }));
    Ok(HandlerOutcome::Done)
}

/// Wait until an instance is available and matches the configuration the
/// nearest prior `modify_instance` step requested for it.
pub(super) async fn wait_instance_available(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let step = &op.steps[idx];
    let instance_id = match step.param_str("instance_id") {
        Some(id) if !id.is_empty() => id.to_string(),
        _ if step.name == WAIT_FOR_TEMP_INSTANCE => result_str(
            op.find_completed_result(actions::CREATE_TEMP_INSTANCE),
            "instance_id",
        )
        .ok_or_else(|| {
            Error::InvalidParameter(
                "instance_id: no completed create_temp_instance result to resolve from".into(),
            )
        })?,
        _ => {
            return Err(Error::InvalidParameter(format!(
                "instance_id: required for {}",
                actions::WAIT_INSTANCE_AVAILABLE
            )));
        }
    };

    let desired = desired_config_for(op, idx, &instance_id);
    let provider = ctx.provider.clone();
    let condition = if desired.is_empty() {
        format!("Instance {instance_id} available")
    } else {
        format!("Instance {instance_id} available with the requested configuration")
    };
    let id = instance_id.clone();
    let step = &mut op.steps[idx];

    wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let id = id.clone();
        let desired = desired.clone();
        async move {
            let info = match provider.get_instance_info(&id).await {
                Ok(info) => info,
                // Not visible yet (e.g. a freshly requested create).
                Err(ref e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if status::is_error(&info.status) {
                return Err(Error::StepFailed(format!(
                    "instance {id} is in error status '{}'",
                    info.status
                )));
            }
            if !status::is_available(&info.status) {
                return Ok(false);
            }
            if let Some(want) = &desired.instance_type {
                if &info.instance_type != want {
                    return Ok(false);
                }
            }
            if let Some(want) = &desired.storage_type {
                if &info.storage_type != want {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    })
    .await
}

/// Issue the provider modification with `apply_immediately`.
pub(super) async fn modify_instance(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let step = &op.steps[idx];
    let instance_id = required_param(step, "instance_id")?.to_string();

    let req = ModifyInstanceRequest {
        instance_id: instance_id.clone(),
        instance_type: step.param_str("instance_type").map(str::to_string),
        storage_type: step.param_str("storage_type").map(str::to_string),
        iops: step.param_i64("iops"),
        storage_throughput: step.param_i64("storage_throughput"),
        parameter_group: step.param_str("parameter_group").map(str::to_string),
        apply_immediately: true,
    };
    ctx.provider.modify_instance(&req).await?;

    info!(instance_id = %instance_id, "Requested instance modification");
    op.steps[idx].result = Some(json!({ "instance_id": instance_id, "requested": true }));
    Ok(HandlerOutcome::Done)
}

/// Delete an instance, refusing if it currently holds the writer role.
pub(super) async fn delete_instance(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let instance_id = required_param(&op.steps[idx], "instance_id")?.to_string();

    let info = ctx.provider.get_cluster_info(&op.cluster_id).await?;
    if let Some(member) = info.member(&instance_id) {
        if member.role == MemberRole::Writer {
            return Err(Error::InvalidState(format!(
                "refusing to delete {instance_id}: it is the current writer of {}",
                op.cluster_id
            )));
        }
    }

    match ctx.provider.delete_instance(&instance_id).await {
        Ok(()) => {
            info!(instance_id = %instance_id, "Requested instance deletion");
            op.steps[idx].result = Some(json!({ "instance_id": instance_id, "deleted": true }));
        }
        Err(ref e) if e.is_not_found() => {
            op.steps[idx].result =
                Some(json!({ "instance_id": instance_id, "already_deleted": true }));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(HandlerOutcome::Done)
}

pub(super) async fn wait_instance_deleted(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let instance_id = required_param(&op.steps[idx], "instance_id")?.to_string();
    let provider = ctx.provider.clone();
    let condition = format!("Instance {instance_id} deleted");
    let id = instance_id.clone();
    let step = &mut op.steps[idx];

    wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let id = id.clone();
        async move {
            match provider.get_instance_info(&id).await {
                Ok(_) => Ok(false),
                Err(ref e) if e.is_not_found() => Ok(true),
                Err(e) => Err(e.into()),
            }
        }
    })
    .await
}

pub(super) async fn reboot_instance(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let instance_id = required_param(&op.steps[idx], "instance_id")?.to_string();
    ctx.provider.reboot_instance(&instance_id).await?;
    info!(instance_id = %instance_id, "Requested instance reboot");
    op.steps[idx].result = Some(json!({ "instance_id": instance_id, "rebooted": true }));
    Ok(HandlerOutcome::Done)
}
