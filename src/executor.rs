//! Step-at-a-time executor.
//!
//! An alternative driver for external schedulers that cannot host a
//! long-lived task per operation. `execute_current_step` runs at most one
//! step synchronously; wait handlers run in single-check mode and report
//! `needs_wait` instead of polling, and `poll_current_step` performs one
//! check of a waiting step's condition. Starting an operation through this
//! executor never spawns a background task.

use std::time::Duration;

use serde::Serialize;

use crate::engine::runner::{self, Begin, Next};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::handlers::{self, HandlerContext, HandlerOutcome};
use crate::types::{InterventionAction, Operation, OperationState, StepState};

/// Outcome of one `execute_current_step` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepExecutionResult {
    pub operation_id: String,
    pub step_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Another step (or retry) is ready to execute.
    pub can_continue: bool,
    /// The current step is waiting; poll it.
    pub needs_wait: bool,
    /// The operation paused for an operator decision.
    pub needs_intervention: bool,
    pub completed: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one `poll_current_step` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollResult {
    pub operation_id: String,
    pub step_index: usize,
    /// The wait condition was satisfied; the step completed and the cursor
    /// advanced.
    pub ready: bool,
    pub can_continue: bool,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct StepExecutor {
    engine: Engine,
}

impl StepExecutor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Mark the operation running without spawning the background task.
    pub async fn start(&self, id: &str) -> Result<()> {
        self.engine.start_inner(id, false).await
    }

    /// Apply an intervention response; `continue` does not spawn a task.
    pub async fn resume(
        &self,
        id: &str,
        action: InterventionAction,
        comment: Option<&str>,
    ) -> Result<()> {
        self.engine.resume_inner(id, action, comment, false).await
    }

    /// Execute at most one step of the operation.
    pub async fn execute_current_step(&self, id: &str) -> Result<StepExecutionResult> {
        let op = self.engine.get_operation(id).await?;
        match op.state {
            OperationState::Running => {}
            OperationState::Completed => return Ok(completed_result(&op)),
            OperationState::Failed => {
                return Ok(StepExecutionResult {
                    operation_id: op.id.clone(),
                    step_index: op.current_step_index,
                    failed: true,
                    error: op.error.clone(),
                    ..Default::default()
                });
            }
            _ => return Err(Error::OperationNotRunning(id.to_string())),
        }

        // Advance over steps already completed (e.g. after recovery).
        {
            let mut registry = self.engine.inner.registry.write().await;
            if let Some(entry) = registry.get_mut(id) {
                while entry
                    .op
                    .current_step()
                    .map(|s| s.state == StepState::Completed)
                    .unwrap_or(false)
                {
                    entry.op.current_step_index += 1;
                }
            }
        }

        match runner::begin_step(&self.engine, id).await {
            Begin::Stop => Err(Error::OperationNotRunning(id.to_string())),
            Begin::Finished(op, events) => {
                self.engine.inner.persist_best_effort(&op, &events).await;
                self.engine.inner.notify_completed(&op).await;
                Ok(completed_result(&op))
            }
            Begin::AutoPaused(op, events, reason) => {
                self.engine.inner.persist_best_effort(&op, &events).await;
                self.engine.inner.notify_paused(&op, &reason).await;
                Ok(StepExecutionResult {
                    operation_id: op.id.clone(),
                    step_index: op.current_step_index,
                    step_name: op.current_step().map(|s| s.name.clone()),
                    needs_intervention: true,
                    pause_reason: Some(reason),
                    ..Default::default()
                })
            }
            Begin::Step(mut snapshot, events, cancel) => {
                self.engine
                    .inner
                    .persist_best_effort(&snapshot, &events)
                    .await;
                let idx = snapshot.current_step_index;
                let mut ctx = self.context(&snapshot).await.single_shot();
                if let Some(cancel) = cancel {
                    ctx = ctx.with_cancel(cancel);
                }

                let result = handlers::execute(&mut ctx, &mut snapshot).await;
                match result {
                    Ok(HandlerOutcome::Waiting) => {
                        let op_clone = self.write_back(id, snapshot).await?;
                        let step = &op_clone.steps[idx];
                        Ok(StepExecutionResult {
                            operation_id: op_clone.id.clone(),
                            step_index: idx,
                            step_name: Some(step.name.clone()),
                            needs_wait: true,
                            wait_condition: step.wait_condition.clone(),
                            ..Default::default()
                        })
                    }
                    other => {
                        let error = other.as_ref().err().map(|e| e.to_string());
                        let next = runner::finish_step(&self.engine, id, snapshot, idx, other).await;
                        self.after_step(id, idx, next, error).await
                    }
                }
            }
        }
    }

    /// Perform a single check of the current step's wait condition.
    pub async fn poll_current_step(&self, id: &str) -> Result<PollResult> {
        let op = self.engine.get_operation(id).await?;
        match op.state {
            OperationState::Running => {}
            OperationState::Completed => {
                return Ok(PollResult {
                    operation_id: op.id.clone(),
                    step_index: op.current_step_index,
                    completed: true,
                    ..Default::default()
                });
            }
            _ => return Err(Error::OperationNotRunning(id.to_string())),
        }
        let idx = op.current_step_index;
        let Some(step) = op.current_step() else {
            // Cursor already past the plan; finalize.
            let result = self.finalize_completion(id).await?;
            return Ok(PollResult {
                operation_id: id.to_string(),
                step_index: idx,
                completed: result.completed,
                ..Default::default()
            });
        };
        if step.state != StepState::Waiting {
            return Err(Error::InvalidState(format!(
                "current step '{}' is not waiting (state '{}')",
                step.name, step.state
            )));
        }

        let mut snapshot = op.clone();
        let mut ctx = self.context(&snapshot).await.single_shot();
        let result = handlers::execute(&mut ctx, &mut snapshot).await;

        match result {
            Ok(HandlerOutcome::Waiting) | Ok(HandlerOutcome::Cancelled) => {
                let op_clone = self.write_back(id, snapshot).await?;
                Ok(PollResult {
                    operation_id: op_clone.id.clone(),
                    step_index: idx,
                    wait_condition: op_clone.steps[idx].wait_condition.clone(),
                    ..Default::default()
                })
            }
            Ok(HandlerOutcome::Done) => {
                let next = runner::finish_step(
                    &self.engine,
                    id,
                    snapshot,
                    idx,
                    Ok(HandlerOutcome::Done),
                )
                .await;
                let step_result = self.after_step(id, idx, next, None).await?;
                Ok(PollResult {
                    operation_id: id.to_string(),
                    step_index: idx,
                    ready: true,
                    can_continue: step_result.can_continue,
                    completed: step_result.completed,
                    ..Default::default()
                })
            }
            Err(e) => {
                let message = e.to_string();
                let next = runner::finish_step(&self.engine, id, snapshot, idx, Err(e)).await;
                let step_result = self.after_step(id, idx, next, Some(message.clone())).await?;
                Ok(PollResult {
                    operation_id: id.to_string(),
                    step_index: idx,
                    can_continue: step_result.can_continue,
                    error: Some(message),
                    ..Default::default()
                })
            }
        }
    }

    async fn context(&self, op: &Operation) -> HandlerContext {
        let provider = self.engine.inner.providers.for_region(&op.region).await;
        let wait_timeout = if op.wait_timeout_secs > 0 {
            Duration::from_secs(op.wait_timeout_secs)
        } else {
            self.engine.inner.config.default_wait_timeout
        };
        HandlerContext::new(
            provider,
            self.engine.inner.config.default_poll_interval,
            wait_timeout,
        )
    }

    /// Copy a handler-mutated snapshot's steps back into the registry.
    async fn write_back(&self, id: &str, snapshot: Operation) -> Result<Operation> {
        let op_clone = {
            let mut registry = self.engine.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
            entry.op.steps = snapshot.steps;
            entry.op.touch();
            entry.op.clone()
        };
        self.engine.inner.persist_best_effort(&op_clone, &[]).await;
        Ok(op_clone)
    }

    /// Translate the runner's verdict into a caller-facing result, closing
    /// out the operation when the cursor ran off the end of the plan.
    async fn after_step(
        &self,
        id: &str,
        idx: usize,
        next: Next,
        error: Option<String>,
    ) -> Result<StepExecutionResult> {
        let op = self.engine.get_operation(id).await?;
        match next {
            Next::Continue => {
                if op.current_step_index >= op.steps.len() {
                    return self.finalize_completion(id).await;
                }
                Ok(StepExecutionResult {
                    operation_id: op.id.clone(),
                    step_index: idx,
                    step_name: op.steps.get(idx).map(|s| s.name.clone()),
                    can_continue: true,
                    ..Default::default()
                })
            }
            Next::Retry => Ok(StepExecutionResult {
                operation_id: op.id.clone(),
                step_index: idx,
                step_name: op.steps.get(idx).map(|s| s.name.clone()),
                can_continue: true,
                error,
                ..Default::default()
            }),
            Next::Stop => {
                let failed = op.steps.get(idx).map(|s| s.state == StepState::Failed).unwrap_or(false);
                Ok(StepExecutionResult {
                    operation_id: op.id.clone(),
                    step_index: idx,
                    step_name: op.steps.get(idx).map(|s| s.name.clone()),
                    needs_intervention: !failed,
                    failed,
                    pause_reason: op.pause_reason.clone(),
                    error,
                    ..Default::default()
                })
            }
        }
    }

    /// Run the completion transition for an operation whose cursor reached
    /// the end of the plan.
    async fn finalize_completion(&self, id: &str) -> Result<StepExecutionResult> {
        match runner::begin_step(&self.engine, id).await {
            Begin::Finished(op, events) => {
                self.engine.inner.persist_best_effort(&op, &events).await;
                self.engine.inner.notify_completed(&op).await;
                Ok(completed_result(&op))
            }
            _ => {
                let op = self.engine.get_operation(id).await?;
                Ok(completed_result(&op))
            }
        }
    }
}

fn completed_result(op: &Operation) -> StepExecutionResult {
    StepExecutionResult {
        operation_id: op.id.clone(),
        step_index: op.current_step_index,
        completed: op.state == OperationState::Completed,
        ..Default::default()
    }
}
