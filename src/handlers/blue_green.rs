//! Blue/green deployment handlers for engine upgrades.
//!
//! The provider stages an upgraded clone ("green") of the source cluster
//! ("blue"), swaps them during a short switchover, and leaves the old
//! resources behind with a `-old1` suffix. These handlers are written to be
//! re-run safely: creation adopts an in-flight deployment, switchover reads
//! the deployment state before acting, and cleanup treats missing resources
//! as already handled.

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, HandlerOutcome, required_param, result_str, wait};
use crate::provider::{CreateBlueGreenRequest, Parameter, ProviderClient, ProviderError};
use crate::types::{Operation, StepState, actions};

/// Parameter group names are capped by the provider; deployment names are
/// capped harder.
const DEPLOYMENT_NAME_MAX: usize = 60;

/// Provider parameter batches beyond this size get rejected wholesale.
const PARAMETER_BATCH_SIZE: usize = 20;

/// Engine family for a target version: postgres families track the major
/// version only, mysql-compatible families keep major.minor.
pub(crate) fn parameter_group_family(engine: &str, version: &str) -> String {
    if engine.contains("postgres") {
        let major = version.split('.').next().unwrap_or(version);
        format!("{engine}{major}")
    } else {
        let mut parts = version.split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) => format!("{engine}{major}.{minor}"),
            _ => format!("{engine}{version}"),
        }
    }
}

fn is_default_group(name: &str) -> bool {
    name.starts_with("default.") || name.starts_with("default-") || name == "default"
}

fn migrated_group_name(current: &str, family: &str) -> String {
    format!("{current}-{}", family.replace('.', "-"))
}

fn deployment_name(cluster_id: &str, target_version: &str) -> String {
    let mut name = format!("bg-{cluster_id}-{}", target_version.replace('.', "-"));
    name.truncate(DEPLOYMENT_NAME_MAX);
    name
}

/// The resource name at the tail of an ARN, or the input unchanged when it
/// is already a bare name.
fn resource_from_arn(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}

// ═══════════════════════════════════════════════════════════════════════════
// prepare_parameter_group
// ═══════════════════════════════════════════════════════════════════════════

/// Resolve the parameter groups the upgraded cluster will use.
///
/// Default groups map to the target family's default; custom groups are
/// recreated for the target family with the user-modified parameters
/// migrated over. The resolved names are patched into the pending
/// `create_blue_green_deployment` (or legacy `modify_cluster`) step.
pub(super) async fn prepare_parameter_group(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let target_version = required_param(&op.steps[idx], "target_engine_version")?.to_string();
    let override_cluster = op.steps[idx]
        .param_str("db_cluster_parameter_group_name")
        .map(str::to_string);
    let override_instance = op.steps[idx]
        .param_str("db_instance_parameter_group_name")
        .map(str::to_string);

    let info = ctx.provider.get_cluster_info(&op.cluster_id).await?;
    let family = parameter_group_family(&info.engine, &target_version);
    let mut skipped: Vec<String> = Vec::new();

    let cluster_group = match override_cluster {
        Some(group) => group,
        None => {
            let current = ctx.provider.get_cluster_parameter_group(&op.cluster_id).await?;
            resolve_group(ctx.provider.as_ref(), &current, &family, true, &mut skipped).await?
        }
    };

    let instance_group = match override_instance {
        Some(group) => group,
        None => {
            let writer = info.writer().ok_or_else(|| {
                Error::InvalidState(format!("cluster {} has no writer", op.cluster_id))
            })?;
            let current = ctx
                .provider
                .get_instance_parameter_group(&writer.instance_id)
                .await?;
            resolve_group(ctx.provider.as_ref(), &current, &family, false, &mut skipped).await?
        }
    };

    // Hand the resolved names to the step that will consume them.
    let mut patched: Option<String> = None;
    for later in op.steps[idx + 1..].iter_mut() {
        if later.state != StepState::Pending {
            continue;
        }
        if later.action == actions::CREATE_BLUE_GREEN_DEPLOYMENT {
            later.params.insert(
                "db_cluster_parameter_group_name".into(),
                Value::from(cluster_group.clone()),
            );
            later.params.insert(
                "db_instance_parameter_group_name".into(),
                Value::from(instance_group.clone()),
            );
            patched = Some(later.action.clone());
            break;
        }
        if later.action == actions::MODIFY_CLUSTER {
            later
                .params
                .insert("parameter_group".into(), Value::from(cluster_group.clone()));
            patched = Some(later.action.clone());
            break;
        }
    }

    if !skipped.is_empty() {
        warn!(
            operation_id = %op.id,
            skipped = ?skipped,
            "Some parameters were rejected by the provider and were not migrated"
        );
    }

    op.steps[idx].result = Some(json!({
        "cluster_parameter_group": cluster_group,
        "instance_parameter_group": instance_group,
        "skipped_parameters": skipped,
        "patched_step": patched,
    }));
    Ok(HandlerOutcome::Done)
}

/// Default group ⇒ the target family default. Custom group ⇒ create (or
/// reuse) a group for the target family and migrate the custom parameters.
async fn resolve_group(
    provider: &dyn ProviderClient,
    current: &str,
    family: &str,
    cluster: bool,
    skipped: &mut Vec<String>,
) -> Result<String> {
    if is_default_group(current) {
        return Ok(provider.get_default_parameter_group(family, cluster).await?);
    }

    let name = migrated_group_name(current, family);
    let description = format!("Migrated from {current} for family {family}");
    let created = if cluster {
        provider
            .create_cluster_parameter_group(&name, family, &description)
            .await
    } else {
        provider
            .create_instance_parameter_group(&name, family, &description)
            .await
    };
    match created {
        Ok(()) => info!(group = %name, family = %family, "Created parameter group"),
        Err(ProviderError::AlreadyExists(_)) => {
            info!(group = %name, "Parameter group already exists; reusing");
        }
        Err(e) => return Err(e.into()),
    }

    let parameters = if cluster {
        provider.get_cluster_custom_parameters(current).await?
    } else {
        provider.get_instance_custom_parameters(current).await?
    };
    skipped.extend(apply_parameters(provider, &name, &parameters, cluster).await?);
    Ok(name)
}

/// Apply parameters in batches; a rejected batch is retried one parameter at
/// a time so a single bad value only loses itself.
async fn apply_parameters(
    provider: &dyn ProviderClient,
    group: &str,
    parameters: &[Parameter],
    cluster: bool,
) -> Result<Vec<String>> {
    let mut skipped = Vec::new();
    for chunk in parameters.chunks(PARAMETER_BATCH_SIZE) {
        let batch = modify_group(provider, group, chunk, cluster).await;
        if batch.is_ok() {
            continue;
        }
        for param in chunk {
            if let Err(e) = modify_group(provider, group, std::slice::from_ref(param), cluster).await
            {
                warn!(
                    group = %group,
                    parameter = %param.name,
                    error = %e,
                    "Provider rejected parameter; skipping it"
                );
                skipped.push(param.name.clone());
            }
        }
    }
    Ok(skipped)
}

async fn modify_group(
    provider: &dyn ProviderClient,
    group: &str,
    parameters: &[Parameter],
    cluster: bool,
) -> std::result::Result<(), ProviderError> {
    if cluster {
        provider.modify_cluster_parameter_group(group, parameters).await
    } else {
        provider.modify_instance_parameter_group(group, parameters).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// create / wait / switchover / cleanup
// ═══════════════════════════════════════════════════════════════════════════

/// Create the blue/green deployment, adopting one that already exists for
/// the source cluster in a usable state.
pub(super) async fn create_blue_green_deployment(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let existing = ctx
        .provider
        .list_blue_green_deployments_for_cluster(&op.cluster_id)
        .await?;
    if let Some(deployment) = existing
        .iter()
        .find(|d| matches!(d.status.as_str(), "PROVISIONING" | "AVAILABLE"))
    {
        info!(
            identifier = %deployment.identifier,
            status = %deployment.status,
            "Adopting existing blue/green deployment"
        );
        op.steps[idx].result = Some(json!({
            "identifier": deployment.identifier,
            "adopted": true,
        }));
        return Ok(HandlerOutcome::Done);
    }

    let step = &op.steps[idx];
    let target_version = required_param(step, "target_engine_version")?.to_string();
    let req = CreateBlueGreenRequest {
        name: deployment_name(&op.cluster_id, &target_version),
        source_arn: ctx.provider.get_cluster_arn(&op.cluster_id).await?,
        target_engine_version: target_version,
        cluster_parameter_group: step
            .param_str("db_cluster_parameter_group_name")
            .map(str::to_string),
        instance_parameter_group: step
            .param_str("db_instance_parameter_group_name")
            .map(str::to_string),
    };

    let identifier = ctx.provider.create_blue_green_deployment(&req).await?;
    info!(identifier = %identifier, "Created blue/green deployment");
    op.steps[idx].result = Some(json!({
        "identifier": identifier,
        "adopted": false,
    }));
    Ok(HandlerOutcome::Done)
}

/// The deployment this operation is driving: an explicit parameter, else the
/// creation step's recorded identifier.
fn deployment_id(op: &Operation, idx: usize) -> Result<String> {
    op.steps[idx]
        .param_str("identifier")
        .map(str::to_string)
        .or_else(|| {
            result_str(
                op.find_completed_result(actions::CREATE_BLUE_GREEN_DEPLOYMENT),
                "identifier",
            )
        })
        .ok_or_else(|| {
            Error::BlueGreenDeploymentNotFound(format!(
                "no deployment recorded for cluster {}",
                op.cluster_id
            ))
        })
}

pub(super) async fn wait_blue_green_available(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let identifier = deployment_id(op, idx)?;
    let provider = ctx.provider.clone();
    let condition = format!("Blue/green deployment {identifier} available");
    let id = identifier.clone();
    let step = &mut op.steps[idx];

    wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let id = id.clone();
        async move {
            let deployment = provider.describe_blue_green_deployment(&id).await?;
            match deployment.status.as_str() {
                "INVALID_CONFIGURATION" | "PROVISIONING_FAILED" => {
                    return Err(Error::StepFailed(format!(
                        "blue/green deployment {id} failed with status '{}'",
                        deployment.status
                    )));
                }
                _ => {}
            }
            if let Some(task) = deployment.tasks.iter().find(|t| t.status == "FAILED") {
                return Err(Error::StepFailed(format!(
                    "blue/green deployment task '{}' failed",
                    task.name
                )));
            }
            let tasks_settled = deployment
                .tasks
                .iter()
                .all(|t| t.status != "IN_PROGRESS" && t.status != "PENDING");
            Ok(deployment.status == "AVAILABLE" && tasks_settled)
        }
    })
    .await
}

/// Initiate the switchover and wait for it to complete.
///
/// Reads the deployment state first: already completed is success, in
/// progress skips initiation, a previous failure is fatal.
pub(super) async fn switchover_blue_green(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let identifier = deployment_id(op, idx)?;
    let timeout = op.steps[idx].param_i64("switchover_timeout");

    let deployment = ctx.provider.describe_blue_green_deployment(&identifier).await?;
    match deployment.status.as_str() {
        "SWITCHOVER_COMPLETED" => {
            op.steps[idx].result = Some(switchover_result(&deployment));
            return Ok(HandlerOutcome::Done);
        }
        "SWITCHOVER_FAILED" => {
            return Err(Error::StepFailed(format!(
                "switchover of {identifier} previously failed; manual investigation required"
            )));
        }
        "SWITCHOVER_IN_PROGRESS" => {
            info!(identifier = %identifier, "Switchover already in progress");
        }
        _ => {
            info!(identifier = %identifier, "Initiating switchover");
            ctx.provider
                .switchover_blue_green_deployment(&identifier, timeout)
                .await?;
        }
    }

    let provider = ctx.provider.clone();
    let condition = format!("Switchover of {identifier} completed");
    let id = identifier.clone();
    let step = &mut op.steps[idx];

    let outcome = wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let id = id.clone();
        async move {
            let deployment = provider.describe_blue_green_deployment(&id).await?;
            match deployment.status.as_str() {
                "SWITCHOVER_COMPLETED" => Ok(true),
                "SWITCHOVER_FAILED" => Err(Error::StepFailed(format!(
                    "switchover of {id} failed"
                ))),
                _ => Ok(false),
            }
        }
    })
    .await?;

    if outcome == HandlerOutcome::Done {
        let deployment = ctx.provider.describe_blue_green_deployment(&identifier).await?;
        op.steps[idx].result = Some(switchover_result(&deployment));
    }
    Ok(outcome)
}

fn switchover_result(deployment: &crate::provider::BlueGreenDeployment) -> Value {
    json!({
        "identifier": deployment.identifier,
        "status": deployment.status,
        "switchover_details": deployment.switchover_details,
    })
}

/// Delete the deployment record and the `-old1` resources the switchover
/// left behind. Missing resources are treated as already cleaned up; any
/// other failure pauses the operation for the operator.
pub(super) async fn cleanup_blue_green(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let identifier = deployment_id(op, idx).ok();
    let (old_cluster, old_instances) = old_resources(ctx, op, identifier.as_deref()).await;

    let intervention = |what: &str, e: &ProviderError| {
        Error::InterventionRequired(format!(
            "cleanup of {what} failed: {e}. Resolve manually, then resume with mark_complete \
             (work already succeeded) or abort."
        ))
    };

    if let Some(id) = &identifier {
        match ctx.provider.delete_blue_green_deployment(id).await {
            Ok(()) => info!(identifier = %id, "Deleted blue/green deployment record"),
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(intervention(&format!("deployment {id}"), &e)),
        }
    }

    let mut deleted_instances = Vec::new();
    for instance in &old_instances {
        match ctx.provider.delete_instance(instance).await {
            Ok(()) => deleted_instances.push(instance.clone()),
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(intervention(&format!("instance {instance}"), &e)),
        }
    }

    let mut deleted_cluster = None;
    if let Some(cluster) = &old_cluster {
        match ctx.provider.delete_cluster(cluster).await {
            Ok(()) => deleted_cluster = Some(cluster.clone()),
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(intervention(&format!("cluster {cluster}"), &e)),
        }
    }

    op.steps[idx].result = Some(json!({
        "deployment": identifier,
        "deleted_cluster": deleted_cluster,
        "deleted_instances": deleted_instances,
    }));
    Ok(HandlerOutcome::Done)
}

/// Figure out which `-old1` resources to remove, in order of preference:
/// the switchover step's recorded details, a fresh describe of the
/// deployment, and finally inference from the original cluster id.
async fn old_resources(
    ctx: &HandlerContext,
    op: &Operation,
    identifier: Option<&str>,
) -> (Option<String>, Vec<String>) {
    if let Some(result) = op.find_completed_result(actions::SWITCHOVER_BLUE_GREEN) {
        let (cluster, instances) = old_from_details(result.get("switchover_details"));
        if cluster.is_some() || !instances.is_empty() {
            return (cluster, instances);
        }
    }

    if let Some(id) = identifier {
        if let Ok(deployment) = ctx.provider.describe_blue_green_deployment(id).await {
            let details = serde_json::to_value(&deployment.switchover_details).ok();
            let (cluster, instances) = old_from_details(details.as_ref());
            if cluster.is_some() || !instances.is_empty() {
                return (cluster, instances);
            }
        }
    }

    // Last resort: the provider's naming convention.
    let cluster = Some(format!("{}-old1", op.cluster_id));
    let instances = op
        .find_completed_result(actions::GET_CLUSTER_INFO)
        .and_then(|v| v.get("members"))
        .and_then(|v| v.as_array())
        .map(|members| {
            members
                .iter()
                .filter_map(|m| m.get("instance_id").and_then(|v| v.as_str()))
                .map(|id| format!("{id}-old1"))
                .collect()
        })
        .unwrap_or_default();
    (cluster, instances)
}

/// Pull the `-old1` resource names out of recorded switchover details.
fn old_from_details(details: Option<&Value>) -> (Option<String>, Vec<String>) {
    let mut cluster = None;
    let mut instances = Vec::new();
    let Some(entries) = details.and_then(|v| v.as_array()) else {
        return (cluster, instances);
    };
    for entry in entries {
        let Some(source) = entry.get("source").and_then(|v| v.as_str()) else {
            continue;
        };
        let name = resource_from_arn(source);
        if !name.ends_with("-old1") {
            continue;
        }
        if source.contains(":cluster:") {
            cluster = Some(name.to_string());
        } else {
            instances.push(name.to_string());
        }
    }
    (cluster, instances)
}
