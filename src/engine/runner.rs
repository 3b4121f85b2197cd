//! Step-execution and rollback tasks.
//!
//! One task per running operation. The task takes a snapshot of the
//! operation under the registry lock, runs the current step's handler
//! outside the lock, and writes the outcome back. Pausing flips the
//! operation state and the cancellation signal; the handler's wait loop
//! observes the signal and returns at its next tick.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{Engine, EngineInner};
use crate::error::Error;
use crate::handlers::{self, HandlerContext, HandlerOutcome};
use crate::types::{Event, EventType, Operation, OperationState, StepState, actions};

pub(crate) fn spawn_runner(engine: Engine, id: String) {
    tokio::spawn(async move {
        run_operation(engine, id).await;
    });
}

pub(crate) fn spawn_rollback(engine: Engine, id: String) {
    tokio::spawn(async move {
        run_rollback(engine, id).await;
    });
}

/// What the snapshot phase decided before any handler runs.
pub(crate) enum Begin {
    /// Operation is no longer running; the task is done.
    Stop,
    /// Cursor reached the end of the plan.
    Finished(Operation, Vec<Event>),
    /// An auto-pause checkpoint fired.
    AutoPaused(Operation, Vec<Event>, String),
    /// Execute the current step against the snapshot.
    Step(Operation, Vec<Event>, Option<watch::Receiver<bool>>),
}

/// What the write-back phase decided.
pub(crate) enum Next {
    Continue,
    Retry,
    Stop,
}

pub(crate) async fn run_operation(engine: Engine, id: String) {
    loop {
        let begin = begin_step(&engine, &id).await;
        match begin {
            Begin::Stop => return,
            Begin::Finished(op, events) => {
                engine.inner.persist_best_effort(&op, &events).await;
                engine.inner.notify_completed(&op).await;
                info!(operation_id = %id, "Operation completed");
                return;
            }
            Begin::AutoPaused(op, events, reason) => {
                engine.inner.persist_best_effort(&op, &events).await;
                engine.inner.notify_paused(&op, &reason).await;
                info!(operation_id = %id, reason = %reason, "Auto-paused");
                return;
            }
            Begin::Step(mut snapshot, events, cancel) => {
                engine.inner.persist_best_effort(&snapshot, &events).await;
                let idx = snapshot.current_step_index;

                let provider = engine.inner.providers.for_region(&snapshot.region).await;
                let wait_timeout = if snapshot.wait_timeout_secs > 0 {
                    Duration::from_secs(snapshot.wait_timeout_secs)
                } else {
                    engine.inner.config.default_wait_timeout
                };
                let mut ctx = HandlerContext::new(
                    provider,
                    engine.inner.config.default_poll_interval,
                    wait_timeout,
                );
                if let Some(cancel) = cancel {
                    ctx = ctx.with_cancel(cancel);
                }

                let result = handlers::execute(&mut ctx, &mut snapshot).await;
                match finish_step(&engine, &id, snapshot, idx, result).await {
                    Next::Continue => continue,
                    Next::Retry => {
                        tokio::time::sleep(engine.inner.config.default_poll_interval).await;
                        continue;
                    }
                    Next::Stop => return,
                }
            }
        }
    }
}

/// Snapshot phase: completion check, auto-pause check, mark the step
/// in-progress. `started_at` is only stamped on the first attempt so step
/// duration covers retries.
pub(crate) async fn begin_step(engine: &Engine, id: &str) -> Begin {
    let mut registry = engine.inner.registry.write().await;
    let Some(entry) = registry.get_mut(id) else {
        return Begin::Stop;
    };
    if entry.op.state != OperationState::Running {
        return Begin::Stop;
    }

    let idx = entry.op.current_step_index;
    if idx >= entry.op.steps.len() {
        entry.op.state = OperationState::Completed;
        entry.op.completed_at = Some(Utc::now());
        entry.op.touch();
        let event = EngineInner::make_event(
            entry,
            EventType::OperationCompleted,
            "Operation completed",
            None,
        );
        return Begin::Finished(entry.op.clone(), vec![event]);
    }

    if entry.op.pause_before_steps.contains(&idx) {
        entry.op.pause_before_steps.remove(&idx);
        let name = entry.op.steps[idx].name.clone();
        let reason =
            format!("Auto-pause before step {idx}: {name}. Resume with continue when ready.");
        entry.op.state = OperationState::Paused;
        entry.op.pause_reason = Some(reason.clone());
        entry.op.touch();
        let event = EngineInner::make_event(
            entry,
            EventType::OperationPaused,
            reason.clone(),
            Some(json!({ "step_index": idx, "auto_pause": true })),
        );
        return Begin::AutoPaused(entry.op.clone(), vec![event], reason);
    }

    let mut first_attempt = false;
    {
        let step = &mut entry.op.steps[idx];
        step.state = StepState::InProgress;
        step.error = None;
        if step.started_at.is_none() {
            step.started_at = Some(Utc::now());
            first_attempt = true;
        }
    }
    entry.op.touch();

    let mut events = Vec::new();
    if first_attempt {
        let name = entry.op.steps[idx].name.clone();
        let action = entry.op.steps[idx].action.clone();
        events.push(EngineInner::make_event(
            entry,
            EventType::StepStarted,
            format!("Step started: {name}"),
            Some(json!({ "step_index": idx, "action": action })),
        ));
    }
    let cancel = entry.cancel.as_ref().map(|tx| tx.subscribe());
    Begin::Step(entry.op.clone(), events, cancel)
}

/// Write-back phase: copy the handler's mutations into the registry and
/// apply the retry / pause policy.
pub(crate) async fn finish_step(
    engine: &Engine,
    id: &str,
    executed: Operation,
    idx: usize,
    result: crate::error::Result<HandlerOutcome>,
) -> Next {
    let mut step_notification: Option<(Operation, crate::types::Step)> = None;
    let mut pause_notification: Option<(Operation, String)> = None;

    let (op_clone, events, next) = {
        let mut registry = engine.inner.registry.write().await;
        let Some(entry) = registry.get_mut(id) else {
            return Next::Stop;
        };
        // Steps are only mutated by this task (and by handlers patching
        // later pending steps), so the executed copy wins wholesale.
        entry.op.steps = executed.steps;

        let mut events = Vec::new();
        let next = match result {
            Ok(HandlerOutcome::Done) => {
                {
                    let step = &mut entry.op.steps[idx];
                    step.state = StepState::Completed;
                    step.completed_at = Some(Utc::now());
                    step.wait_condition = None;
                    step.error = None;
                }
                entry.op.current_step_index = idx + 1;
                entry.op.touch();
                let step = entry.op.steps[idx].clone();
                events.push(EngineInner::make_event(
                    entry,
                    EventType::StepCompleted,
                    format!("Step completed: {}", step.name),
                    Some(json!({ "step_index": idx, "result": step.result.clone() })),
                ));
                step_notification = Some((entry.op.clone(), step));
                Next::Continue
            }
            Ok(HandlerOutcome::Cancelled) => {
                // A pause flipped the signal; put the step back so resume
                // re-executes it from the top.
                let step = &mut entry.op.steps[idx];
                step.state = StepState::Pending;
                step.wait_condition = None;
                entry.op.touch();
                Next::Stop
            }
            Ok(HandlerOutcome::Waiting) => {
                // Only single-shot mode produces Waiting; a blocking handler
                // returning it is a dispatch bug.
                warn!(operation_id = %id, step_index = idx, "Unexpected Waiting outcome");
                let step = &mut entry.op.steps[idx];
                step.state = StepState::Pending;
                entry.op.touch();
                Next::Stop
            }
            Err(Error::InterventionRequired(reason)) => {
                {
                    let step = &mut entry.op.steps[idx];
                    step.state = StepState::Pending;
                    step.error = Some(reason.clone());
                    step.wait_condition = None;
                }
                entry.op.state = OperationState::Paused;
                entry.op.pause_reason = Some(reason.clone());
                entry.op.touch();
                events.push(EngineInner::make_event(
                    entry,
                    EventType::InterventionRequired,
                    reason.clone(),
                    Some(json!({ "step_index": idx })),
                ));
                events.push(EngineInner::make_event(
                    entry,
                    EventType::OperationPaused,
                    format!("Operation paused: {reason}"),
                    None,
                ));
                pause_notification = Some((entry.op.clone(), reason));
                Next::Stop
            }
            Err(e) => {
                let name = entry.op.steps[idx].name.clone();
                let message = e.to_string();
                let can_retry = {
                    let step = &entry.op.steps[idx];
                    step.retry_count < step.max_retries
                };
                if can_retry {
                    let attempt = {
                        let step = &mut entry.op.steps[idx];
                        step.retry_count += 1;
                        step.state = StepState::Pending;
                        step.error = None;
                        step.wait_condition = None;
                        step.retry_count
                    };
                    entry.op.touch();
                    warn!(
                        operation_id = %id,
                        step = %name,
                        attempt = attempt,
                        error = %message,
                        "Step failed; retrying"
                    );
                    events.push(EngineInner::make_event(
                        entry,
                        EventType::StepRetry,
                        format!("Step '{name}' failed (attempt {attempt}): {message}; retrying"),
                        Some(json!({ "step_index": idx, "attempt": attempt })),
                    ));
                    Next::Retry
                } else {
                    {
                        let step = &mut entry.op.steps[idx];
                        step.state = StepState::Failed;
                        step.error = Some(message.clone());
                        step.completed_at = Some(Utc::now());
                        step.wait_condition = None;
                    }
                    let reason = format!(
                        "Step failed: {name} - {message}. Resume with continue to retry, \
                         rollback, or abort."
                    );
                    entry.op.state = OperationState::Paused;
                    entry.op.pause_reason = Some(reason.clone());
                    entry.op.touch();
                    error!(
                        operation_id = %id,
                        step = %name,
                        error = %message,
                        "Step failed; retries exhausted"
                    );
                    events.push(EngineInner::make_event(
                        entry,
                        EventType::StepFailed,
                        format!("Step failed: {name}: {message}"),
                        Some(json!({ "step_index": idx })),
                    ));
                    events.push(EngineInner::make_event(
                        entry,
                        EventType::OperationPaused,
                        reason.clone(),
                        None,
                    ));
                    pause_notification = Some((entry.op.clone(), reason));
                    Next::Stop
                }
            }
        };
        (entry.op.clone(), events, next)
    };

    engine.inner.persist_best_effort(&op_clone, &events).await;
    if let Some((op, step)) = step_notification {
        engine.inner.notify_step_completed(&op, &step).await;
    }
    if let Some((op, reason)) = pause_notification {
        engine.inner.notify_paused(&op, &reason).await;
    }
    next
}

// ═══════════════════════════════════════════════════════════════════════════
// Rollback
// ═══════════════════════════════════════════════════════════════════════════

/// Delete every resource a completed `create_temp_instance` step created.
/// Missing resources are tolerated; anything else leaves the operation
/// paused so the operator can retry the rollback or abort.
pub(crate) async fn run_rollback(engine: Engine, id: String) {
    let snapshot = {
        let registry = engine.inner.registry.read().await;
        registry.get(&id).map(|e| e.op.clone())
    };
    let Some(op) = snapshot else {
        return;
    };
    let provider = engine.inner.providers.for_region(&op.region).await;

    let mut deleted: Vec<String> = Vec::new();
    let mut failure: Option<String> = None;

    let temp_ids: Vec<String> = op
        .steps
        .iter()
        .filter(|s| s.action == actions::CREATE_TEMP_INSTANCE && s.state == StepState::Completed)
        .filter_map(|s| {
            s.result
                .as_ref()
                .and_then(|r| r.get("instance_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .collect();

    for instance_id in temp_ids {
        // Never delete the current writer, even during rollback.
        match provider.get_cluster_info(&op.cluster_id).await {
            Ok(info)
                if info
                    .member(&instance_id)
                    .map(|m| m.role == crate::provider::MemberRole::Writer)
                    .unwrap_or(false) =>
            {
                failure = Some(format!(
                    "temp instance {instance_id} currently holds the writer role; \
                     fail over before rolling back"
                ));
                break;
            }
            _ => {}
        }
        match provider.delete_instance(&instance_id).await {
            Ok(()) => {
                info!(operation_id = %id, instance_id = %instance_id, "Rolled back temp instance");
                deleted.push(instance_id);
            }
            Err(ref e) if e.is_not_found() => {}
            Err(e) => {
                failure = Some(format!("failed to delete temp instance {instance_id}: {e}"));
                break;
            }
        }
    }

    let outcome = {
        let mut registry = engine.inner.registry.write().await;
        let Some(entry) = registry.get_mut(&id) else {
            return;
        };
        match &failure {
            None => {
                entry.op.state = OperationState::RolledBack;
                entry.op.completed_at = Some(Utc::now());
                entry.op.pause_reason = None;
                entry.op.touch();
                let event = EngineInner::make_event(
                    entry,
                    EventType::RollbackCompleted,
                    "Rollback completed",
                    Some(json!({ "deleted_instances": deleted })),
                );
                (entry.op.clone(), vec![event], None)
            }
            Some(message) => {
                let reason = format!(
                    "Rollback failed: {message}. Resume with rollback to retry or abort."
                );
                entry.op.state = OperationState::Paused;
                entry.op.error = Some(Error::RollbackFailed(message.clone()).to_string());
                entry.op.pause_reason = Some(reason.clone());
                entry.op.touch();
                let event = EngineInner::make_event(
                    entry,
                    EventType::OperationPaused,
                    reason.clone(),
                    None,
                );
                (entry.op.clone(), vec![event], Some(reason))
            }
        }
    };

    let (op_clone, events, pause_reason) = outcome;
    engine.inner.persist_best_effort(&op_clone, &events).await;
    match pause_reason {
        None => {
            info!(operation_id = %id, "Rollback completed");
        }
        Some(reason) => {
            engine.inner.notify_paused(&op_clone, &reason).await;
            error!(operation_id = %id, reason = %reason, "Rollback failed");
        }
    }
}
