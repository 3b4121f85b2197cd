//! Step handlers.
//!
//! Each handler is a function of the operation and its current step: it
//! calls the provider, may enter a polling wait, and records its result on
//! the step. Handlers must be safe to re-run after a partial attempt: the
//! engine retries them and the step-at-a-time executor re-invokes waiting
//! handlers to poll.

mod blue_green;
mod cluster;
mod instance;
mod proxy;
pub(crate) mod wait;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::provider::ProviderClient;
use crate::types::{Operation, Step, actions};

/// How wait handlers behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Poll on a ticker until ready, timeout, or cancellation.
    Blocking,
    /// Perform exactly one check and report `Waiting` when not ready.
    Single,
}

/// What a handler invocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The step finished; the engine marks it completed and advances.
    Done,
    /// Single-shot mode only: the wait condition is not yet satisfied.
    Waiting,
    /// A pause interrupted the poll loop; the step goes back to pending.
    Cancelled,
}

/// Everything a handler needs besides the operation itself.
pub struct HandlerContext {
    pub provider: Arc<dyn ProviderClient>,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    pub mode: PollMode,
    pub(crate) cancel: watch::Receiver<bool>,
    // Keeps the channel alive when no external canceller was attached.
    _own_cancel: Option<watch::Sender<bool>>,
}

impl HandlerContext {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            provider,
            poll_interval,
            wait_timeout,
            mode: PollMode::Blocking,
            cancel: rx,
            _own_cancel: Some(tx),
        }
    }

    /// Attach the operation's cancellation signal.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self._own_cancel = None;
        self
    }

    /// Switch wait handlers to single-check mode.
    pub fn single_shot(mut self) -> Self {
        self.mode = PollMode::Single;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Dispatch the operation's current step to its handler.
pub async fn execute(ctx: &mut HandlerContext, op: &mut Operation) -> Result<HandlerOutcome> {
    let idx = op.current_step_index;
    let action = op
        .steps
        .get(idx)
        .map(|s| s.action.clone())
        .ok_or_else(|| Error::InvalidState(format!("no step at index {idx}")))?;

    match action.as_str() {
        actions::GET_CLUSTER_INFO => cluster::get_cluster_info(ctx, op, idx).await,
        actions::WAIT_CLUSTER_AVAILABLE => cluster::wait_cluster_available(ctx, op, idx).await,
        actions::MODIFY_CLUSTER => cluster::modify_cluster(ctx, op, idx).await,
        actions::CREATE_SNAPSHOT => cluster::create_snapshot(ctx, op, idx).await,
        actions::WAIT_SNAPSHOT_AVAILABLE => cluster::wait_snapshot_available(ctx, op, idx).await,
        actions::FAILOVER_CLUSTER => cluster::failover_cluster(ctx, op, idx).await,
        actions::CREATE_TEMP_INSTANCE => instance::create_temp_instance(ctx, op, idx).await,
        actions::WAIT_INSTANCE_AVAILABLE => instance::wait_instance_available(ctx, op, idx).await,
        actions::MODIFY_INSTANCE => instance::modify_instance(ctx, op, idx).await,
        actions::DELETE_INSTANCE => instance::delete_instance(ctx, op, idx).await,
        actions::WAIT_INSTANCE_DELETED => instance::wait_instance_deleted(ctx, op, idx).await,
        actions::REBOOT_INSTANCE => instance::reboot_instance(ctx, op, idx).await,
        actions::PREPARE_PARAMETER_GROUP => {
            blue_green::prepare_parameter_group(ctx, op, idx).await
        }
        actions::CREATE_BLUE_GREEN_DEPLOYMENT => {
            blue_green::create_blue_green_deployment(ctx, op, idx).await
        }
        actions::WAIT_BLUE_GREEN_AVAILABLE => {
            blue_green::wait_blue_green_available(ctx, op, idx).await
        }
        actions::SWITCHOVER_BLUE_GREEN => blue_green::switchover_blue_green(ctx, op, idx).await,
        actions::CLEANUP_BLUE_GREEN => blue_green::cleanup_blue_green(ctx, op, idx).await,
        actions::VALIDATE_PROXY_HEALTH => proxy::validate_proxy_health(ctx, op, idx).await,
        actions::DEREGISTER_PROXY_TARGETS => {
            proxy::deregister_proxy_targets(ctx, op, idx).await
        }
        // retarget_proxies predates the register/deregister split; it behaves
        // exactly like register.
        actions::REGISTER_PROXY_TARGETS | actions::RETARGET_PROXIES => {
            proxy::register_proxy_targets(ctx, op, idx).await
        }
        other => Err(Error::StepFailed(format!("unknown step action '{other}'"))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Non-empty string parameter or `InvalidParameter`.
pub(crate) fn required_param<'a>(step: &'a Step, key: &str) -> Result<&'a str> {
    match step.param_str(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::InvalidParameter(format!(
            "{key}: required for {}",
            step.action
        ))),
    }
}

/// Configuration a wait should verify, taken from the nearest prior
/// `modify_instance` step targeting the same instance.
#[derive(Debug, Default, Clone)]
pub(crate) struct DesiredConfig {
    pub instance_type: Option<String>,
    pub storage_type: Option<String>,
}

impl DesiredConfig {
    pub fn is_empty(&self) -> bool {
        self.instance_type.is_none() && self.storage_type.is_none()
    }
}

pub(crate) fn desired_config_for(
    op: &Operation,
    upto: usize,
    instance_id: &str,
) -> DesiredConfig {
    for step in op.steps[..upto].iter().rev() {
        if step.action == actions::MODIFY_INSTANCE && step.instance_id() == Some(instance_id) {
            return DesiredConfig {
                instance_type: step.param_str("instance_type").map(str::to_string),
                storage_type: step.param_str("storage_type").map(str::to_string),
            };
        }
    }
    DesiredConfig::default()
}

/// Read a string field out of a completed step's result.
pub(crate) fn result_str(result: Option<&Value>, key: &str) -> Option<String> {
    result
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
