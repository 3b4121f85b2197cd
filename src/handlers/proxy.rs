//! Proxy handlers for engine upgrades.
//!
//! Proxies fronting the cluster must be detached before the blue/green
//! switchover and reattached afterwards. Discovery happens once in
//! `validate_proxy_health`; the register/deregister handlers read the proxy
//! list from that step's result and fall back to live discovery when the
//! plan skipped validation.

use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, HandlerOutcome, wait};
use crate::provider::ProviderError;
use crate::status;
use crate::types::{Operation, actions};

const TARGET_HEALTH_AVAILABLE: &str = "AVAILABLE";
const TARGET_TYPE_CLUSTER: &str = "TRACKED_CLUSTER";
const TARGET_TYPE_INSTANCE: &str = "RDS_INSTANCE";

/// Find every proxy whose targets include the cluster and require each to be
/// available with at least one healthy target.
pub(super) async fn validate_proxy_health(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let proxies = ctx.provider.find_proxies_for_cluster(&op.cluster_id).await?;
    if proxies.is_empty() {
        info!(cluster_id = %op.cluster_id, "No proxies front this cluster");
        op.steps[idx].result = Some(json!({ "proxies": [] }));
        return Ok(HandlerOutcome::Done);
    }

    for proxy in &proxies {
        if !status::is_available(&proxy.status) {
            return Err(Error::StepFailed(format!(
                "proxy {} is not available (status '{}')",
                proxy.name, proxy.status
            )));
        }
        let targets = ctx.provider.get_proxy_targets(&proxy.name).await?;
        let healthy = targets.iter().any(|t| t.health == TARGET_HEALTH_AVAILABLE);
        if !healthy {
            return Err(Error::StepFailed(format!(
                "proxy {} has no healthy targets",
                proxy.name
            )));
        }
    }

    let names: Vec<String> = proxies.into_iter().map(|p| p.name).collect();
    op.steps[idx].result = Some(json!({ "proxies": names }));
    Ok(HandlerOutcome::Done)
}

/// Proxy names recorded by `validate_proxy_health`, or a live lookup when the
/// plan never validated (e.g. the standalone retarget alias).
async fn proxy_names(ctx: &HandlerContext, op: &Operation) -> Result<Vec<String>> {
    if let Some(result) = op.find_completed_result(actions::VALIDATE_PROXY_HEALTH) {
        let names = result
            .get("proxies")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        return Ok(names);
    }
    Ok(ctx
        .provider
        .find_proxies_for_cluster(&op.cluster_id)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect())
}

pub(super) async fn deregister_proxy_targets(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let names = proxy_names(ctx, op).await?;
    let mut deregistered = Vec::new();
    for name in &names {
        match ctx.provider.deregister_proxy_targets(name).await {
            Ok(()) => {
                info!(proxy = %name, "Deregistered proxy targets");
                deregistered.push(name.clone());
            }
            // Nothing registered is the state we wanted.
            Err(ref e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    op.steps[idx].result = Some(json!({ "deregistered": deregistered }));
    Ok(HandlerOutcome::Done)
}

/// Register the cluster with each proxy, then wait for the instance targets
/// to come healthy. Proxies already tracking the cluster with healthy
/// targets are recorded and left alone.
pub(super) async fn register_proxy_targets(
    ctx: &mut HandlerContext,
    op: &mut Operation,
    idx: usize,
) -> Result<HandlerOutcome> {
    let names = proxy_names(ctx, op).await?;
    if names.is_empty() {
        op.steps[idx].result = Some(json!({ "proxies": [], "already_registered": false }));
        return Ok(HandlerOutcome::Done);
    }

    let mut all_already = true;
    for name in &names {
        let targets = ctx.provider.get_proxy_targets(name).await?;
        let tracked = targets
            .iter()
            .any(|t| t.target_type == TARGET_TYPE_CLUSTER && t.id == op.cluster_id);
        let healthy = targets
            .iter()
            .any(|t| t.target_type == TARGET_TYPE_INSTANCE && t.health == TARGET_HEALTH_AVAILABLE);
        if tracked && healthy {
            info!(proxy = %name, "Cluster already registered with healthy targets");
            continue;
        }
        all_already = false;
        match ctx.provider.register_proxy_targets(name, &op.cluster_id).await {
            Ok(()) => info!(proxy = %name, "Registered cluster with proxy"),
            Err(ProviderError::AlreadyExists(_)) => {
                info!(proxy = %name, "Registration reported already-registered; continuing");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if all_already {
        op.steps[idx].result = Some(json!({ "proxies": names, "already_registered": true }));
        return Ok(HandlerOutcome::Done);
    }

    let provider = ctx.provider.clone();
    let check_names = names.clone();
    let condition = "Proxy instance targets available".to_string();
    let step = &mut op.steps[idx];

    let outcome = wait::poll_until(ctx, step, &condition, move || {
        let provider = provider.clone();
        let names = check_names.clone();
        async move {
            for name in &names {
                let targets = provider.get_proxy_targets(name).await?;
                let instances: Vec<_> = targets
                    .iter()
                    .filter(|t| t.target_type == TARGET_TYPE_INSTANCE)
                    .collect();
                if instances.is_empty()
                    || instances.iter().any(|t| t.health != TARGET_HEALTH_AVAILABLE)
                {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    })
    .await?;

    if outcome == HandlerOutcome::Done {
        op.steps[idx].result = Some(json!({ "proxies": names, "already_registered": false }));
    }
    Ok(outcome)
}
