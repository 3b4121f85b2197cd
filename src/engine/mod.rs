//! Operation engine.
//!
//! Owns the in-memory registry of operations (the store is the durable
//! copy), enforces lifecycle transitions and the one-active-operation-per-
//! cluster rule, emits events, and spawns the step-execution and rollback
//! tasks in [`runner`].

pub(crate) mod runner;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::plan;
use crate::provider::ProviderManager;
use crate::store::{OperationStore, SkippedEntry};
use crate::types::{
    CreateOperationRequest, Event, EventType, InterventionAction, Operation, OperationState, Step,
    StepState,
};

/// Outcome of [`Engine::recover`].
#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub recovered: usize,
    pub resumed: Vec<String>,
    pub demoted: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

pub(crate) struct OperationEntry {
    pub op: Operation,
    /// In-memory event log; authoritative at runtime.
    pub events: Vec<Event>,
    /// Last-used event sequence number.
    pub sequence: u64,
    /// Cancellation signal for the running step task.
    pub cancel: Option<watch::Sender<bool>>,
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub registry: RwLock<HashMap<String, OperationEntry>>,
    pub store: Arc<dyn OperationStore>,
    pub notifier: Arc<dyn Notifier>,
    pub providers: ProviderManager,
}

/// Cheap to clone; tasks carry their own handle.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl EngineInner {
    /// Record an event on the entry's in-memory log with the next sequence
    /// number. The caller persists the returned clone after releasing the
    /// registry lock.
    pub(crate) fn make_event(
        entry: &mut OperationEntry,
        event_type: EventType,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Event {
        entry.sequence += 1;
        let mut event = Event::new(&entry.op.id, event_type, message);
        event.sequence = entry.sequence;
        event.data = data;
        entry.events.push(event.clone());
        event
    }

    /// Persist the snapshot, then append events best-effort.
    pub(crate) async fn persist(&self, op: &Operation, events: &[Event]) -> Result<()> {
        self.store.save_operation(op).await.map_err(|e| {
            error!(operation_id = %op.id, error = %e, "Failed to persist operation snapshot");
            e
        })?;
        for event in events {
            if let Err(e) = self.store.append_event(event).await {
                warn!(
                    operation_id = %op.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to append event"
                );
            }
        }
        Ok(())
    }

    /// Persistence inside the step task never takes the operation down; the
    /// in-memory registry stays authoritative and the failure is logged.
    pub(crate) async fn persist_best_effort(&self, op: &Operation, events: &[Event]) {
        let _ = self.persist(op, events).await;
    }

    pub(crate) async fn notify_started(&self, op: &Operation) {
        if let Err(e) = self.notifier.operation_started(op).await {
            warn!(operation_id = %op.id, error = %e, "Notifier failed (operation_started)");
        }
    }

    pub(crate) async fn notify_completed(&self, op: &Operation) {
        if let Err(e) = self.notifier.operation_completed(op).await {
            warn!(operation_id = %op.id, error = %e, "Notifier failed (operation_completed)");
        }
    }

    pub(crate) async fn notify_failed(&self, op: &Operation, error_msg: &str) {
        if let Err(e) = self.notifier.operation_failed(op, error_msg).await {
            warn!(operation_id = %op.id, error = %e, "Notifier failed (operation_failed)");
        }
    }

    pub(crate) async fn notify_paused(&self, op: &Operation, reason: &str) {
        if let Err(e) = self.notifier.operation_paused(op, reason).await {
            warn!(operation_id = %op.id, error = %e, "Notifier failed (operation_paused)");
        }
    }

    pub(crate) async fn notify_step_completed(&self, op: &Operation, step: &Step) {
        if let Err(e) = self.notifier.step_completed(op, step).await {
            warn!(operation_id = %op.id, error = %e, "Notifier failed (step_completed)");
        }
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        providers: ProviderManager,
        store: Arc<dyn OperationStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: RwLock::new(HashMap::new()),
                store,
                notifier,
                providers,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the durable registry and apply the restart policy to operations
    /// that were `running` at crash time.
    pub async fn recover(&self) -> Result<RecoverySummary> {
        let report = self.inner.store.load_all().await?;
        let mut summary = RecoverySummary {
            recovered: report.operations.len(),
            skipped: report.skipped,
            ..Default::default()
        };

        let mut running = Vec::new();
        {
            let mut registry = self.inner.registry.write().await;
            for op in report.operations {
                let id = op.id.clone();
                let events = report.events.get(&id).cloned().unwrap_or_default();
                let sequence = report
                    .event_sequences
                    .get(&id)
                    .copied()
                    .unwrap_or(events.len() as u64);
                if op.state == OperationState::Running {
                    running.push(id.clone());
                }
                registry.insert(
                    id,
                    OperationEntry {
                        op,
                        events,
                        sequence,
                        cancel: None,
                    },
                );
            }
        }

        for id in running {
            if self.inner.config.auto_resume_on_restart {
                info!(operation_id = %id, "Auto-resuming operation after restart");
                // Handlers are idempotent, so re-running the current step is
                // safe even if the crash interrupted it mid-flight.
                {
                    let mut registry = self.inner.registry.write().await;
                    if let Some(entry) = registry.get_mut(&id) {
                        let (tx, _rx) = watch::channel(false);
                        entry.cancel = Some(tx);
                    }
                }
                runner::spawn_runner(self.clone(), id.clone());
                summary.resumed.push(id);
            } else {
                let reason = "Server restarted - manual resume required".to_string();
                let snapshot = {
                    let mut registry = self.inner.registry.write().await;
                    let Some(entry) = registry.get_mut(&id) else {
                        continue;
                    };
                    entry.op.state = OperationState::Paused;
                    entry.op.pause_reason = Some(reason.clone());
                    // Put an interrupted step back so resume re-executes it.
                    if let Some(step) = entry.op.current_step_mut() {
                        if matches!(step.state, StepState::InProgress | StepState::Waiting) {
                            step.state = StepState::Pending;
                            step.wait_condition = None;
                        }
                    }
                    entry.op.touch();
                    let event = EngineInner::make_event(
                        entry,
                        EventType::OperationPaused,
                        reason.clone(),
                        None,
                    );
                    Some((entry.op.clone(), event))
                };
                if let Some((op, event)) = snapshot {
                    self.inner.persist_best_effort(&op, &[event]).await;
                    self.inner.notify_paused(&op, &reason).await;
                }
                summary.demoted.push(id);
            }
        }

        info!(
            recovered = summary.recovered,
            resumed = summary.resumed.len(),
            demoted = summary.demoted.len(),
            skipped = summary.skipped.len(),
            "Recovery complete"
        );
        Ok(summary)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Build a plan for the request and register the operation.
    pub async fn create_operation(&self, req: CreateOperationRequest) -> Result<Operation> {
        let region = req
            .region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.inner.config.default_region.clone());

        self.check_cluster_free(&req.cluster_id, &region).await?;

        let provider = self.inner.providers.for_region(&region).await;
        let mut op = Operation::new(req.kind, &req.cluster_id, &region, req.parameters);
        if let Some(timeout) = req.wait_timeout {
            op.wait_timeout_secs = timeout;
        }

        let plan = plan::build_plan(
            provider.as_ref(),
            &op.id,
            req.kind,
            &req.cluster_id,
            &op.parameters,
            self.inner.config.default_max_retries,
        )
        .await?;
        op.steps = plan.steps;
        op.pause_before_steps = plan.pause_before_steps;
        op.validate()?;

        self.register(op).await
    }

    /// Register a caller-built operation (custom plans, tests). The plan is
    /// validated and the cluster-exclusivity rule applies.
    pub async fn register_operation(&self, op: Operation) -> Result<Operation> {
        op.validate()?;
        plan::validate_plan(&op.steps)?;
        self.register(op).await
    }

    async fn check_cluster_free(&self, cluster_id: &str, region: &str) -> Result<()> {
        let registry = self.inner.registry.read().await;
        let taken = registry
            .values()
            .any(|e| e.op.cluster_id == cluster_id && e.op.region == region && e.op.state.is_active());
        if taken {
            return Err(Error::OperationAlreadyRunning {
                cluster_id: cluster_id.to_string(),
                region: region.to_string(),
            });
        }
        Ok(())
    }

    async fn register(&self, op: Operation) -> Result<Operation> {
        let (op_clone, event) = {
            let mut registry = self.inner.registry.write().await;
            // Re-check exclusivity: plan building dropped the lock.
            let taken = registry.values().any(|e| {
                e.op.cluster_id == op.cluster_id
                    && e.op.region == op.region
                    && e.op.state.is_active()
            });
            if taken {
                return Err(Error::OperationAlreadyRunning {
                    cluster_id: op.cluster_id.clone(),
                    region: op.region.clone(),
                });
            }
            if registry.contains_key(&op.id) {
                return Err(Error::InvalidState(format!(
                    "operation {} is already registered",
                    op.id
                )));
            }

            let id = op.id.clone();
            let message = format!("Created {} operation for cluster {}", op.kind, op.cluster_id);
            let data = json!({
                "kind": op.kind,
                "cluster_id": op.cluster_id,
                "region": op.region,
                "steps": op.steps.len(),
            });
            let mut entry = OperationEntry {
                op,
                events: Vec::new(),
                sequence: 0,
                cancel: None,
            };
            let event = EngineInner::make_event(
                &mut entry,
                EventType::OperationCreated,
                message,
                Some(data),
            );
            let op_clone = entry.op.clone();
            registry.insert(id, entry);
            (op_clone, event)
        };

        self.inner.persist(&op_clone, &[event]).await?;
        info!(
            operation_id = %op_clone.id,
            kind = %op_clone.kind,
            cluster_id = %op_clone.cluster_id,
            steps = op_clone.steps.len(),
            "Operation created"
        );
        Ok(op_clone)
    }

    /// Transition `created | paused → running` and spawn the step task.
    pub async fn start_operation(&self, id: &str) -> Result<()> {
        self.start_inner(id, true).await
    }

    pub(crate) async fn start_inner(&self, id: &str, spawn: bool) -> Result<()> {
        let (op_clone, events) = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

            match entry.op.state {
                OperationState::Created | OperationState::Paused => {}
                other => {
                    return Err(Error::InvalidState(format!(
                        "operation {id} cannot start from state '{other}'"
                    )));
                }
            }
            let resumed = entry.op.state == OperationState::Paused;
            entry.op.state = OperationState::Running;
            entry.op.pause_reason = None;
            if entry.op.started_at.is_none() {
                entry.op.started_at = Some(Utc::now());
            }
            entry.op.touch();
            let (tx, _rx) = watch::channel(false);
            entry.cancel = Some(tx);

            let mut events = Vec::new();
            if resumed {
                events.push(EngineInner::make_event(
                    entry,
                    EventType::OperationResumed,
                    "Operation resumed",
                    None,
                ));
            }
            (entry.op.clone(), events)
        };

        self.inner.persist(&op_clone, &events).await?;
        self.inner.notify_started(&op_clone).await;
        if spawn {
            runner::spawn_runner(self.clone(), id.to_string());
        }
        Ok(())
    }

    /// Pause a running operation. Refused on the final step while it is
    /// executing, because the pause could never be observed.
    pub async fn pause_operation(&self, id: &str, reason: &str) -> Result<()> {
        let (op_clone, events) = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

            if entry.op.state != OperationState::Running {
                return Err(Error::OperationNotRunning(id.to_string()));
            }
            let idx = entry.op.current_step_index;
            if idx + 1 == entry.op.steps.len()
                && matches!(
                    entry.op.steps[idx].state,
                    StepState::InProgress | StepState::Waiting
                )
            {
                return Err(Error::InvalidState(
                    "cannot pause on the final step while it is executing".into(),
                ));
            }

            entry.op.state = OperationState::Paused;
            entry.op.pause_reason = Some(reason.to_string());
            entry.op.touch();
            if let Some(cancel) = &entry.cancel {
                let _ = cancel.send(true);
            }
            let event = EngineInner::make_event(
                entry,
                EventType::OperationPaused,
                format!("Operation paused: {reason}"),
                None,
            );
            (entry.op.clone(), vec![event])
        };

        self.inner.persist(&op_clone, &events).await?;
        self.inner.notify_paused(&op_clone, reason).await;
        Ok(())
    }

    /// Apply an operator response to a paused operation.
    pub async fn resume_operation(
        &self,
        id: &str,
        action: InterventionAction,
        comment: Option<&str>,
    ) -> Result<()> {
        self.resume_inner(id, action, comment, true).await
    }

    pub(crate) async fn resume_inner(
        &self,
        id: &str,
        action: InterventionAction,
        comment: Option<&str>,
        spawn: bool,
    ) -> Result<()> {
        {
            let registry = self.inner.registry.read().await;
            let entry = registry
                .get(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
            if entry.op.state != OperationState::Paused {
                return Err(Error::OperationNotPaused(id.to_string()));
            }
        }
        info!(operation_id = %id, action = %action, "Intervention response");

        match action {
            InterventionAction::Continue => self.start_inner(id, spawn).await,
            InterventionAction::Rollback => {
                let (op_clone, events) = {
                    let mut registry = self.inner.registry.write().await;
                    let entry = registry
                        .get_mut(id)
                        .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                    if entry.op.state != OperationState::Paused {
                        return Err(Error::OperationNotPaused(id.to_string()));
                    }
                    entry.op.state = OperationState::RollingBack;
                    entry.op.pause_reason = None;
                    entry.op.touch();
                    let event = EngineInner::make_event(
                        entry,
                        EventType::RollbackStarted,
                        "Rollback started",
                        None,
                    );
                    (entry.op.clone(), vec![event])
                };
                self.inner.persist(&op_clone, &events).await?;
                runner::spawn_rollback(self.clone(), id.to_string());
                Ok(())
            }
            InterventionAction::Abort => {
                let (op_clone, events, error_msg) = {
                    let mut registry = self.inner.registry.write().await;
                    let entry = registry
                        .get_mut(id)
                        .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                    if entry.op.state != OperationState::Paused {
                        return Err(Error::OperationNotPaused(id.to_string()));
                    }
                    let mut error_msg = entry
                        .op
                        .pause_reason
                        .clone()
                        .unwrap_or_else(|| "aborted by operator".to_string());
                    if let Some(comment) = comment {
                        error_msg = format!("{error_msg} ({comment})");
                    }
                    entry.op.state = OperationState::Failed;
                    entry.op.error = Some(format!("aborted: {error_msg}"));
                    entry.op.pause_reason = None;
                    entry.op.completed_at = Some(Utc::now());
                    entry.op.touch();
                    let event = EngineInner::make_event(
                        entry,
                        EventType::OperationAborted,
                        format!("Operation aborted: {error_msg}"),
                        None,
                    );
                    (entry.op.clone(), vec![event], error_msg)
                };
                self.inner.persist(&op_clone, &events).await?;
                self.inner.notify_failed(&op_clone, &error_msg).await;
                Ok(())
            }
            InterventionAction::MarkComplete => {
                let (op_clone, events) = {
                    let mut registry = self.inner.registry.write().await;
                    let entry = registry
                        .get_mut(id)
                        .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                    if entry.op.state != OperationState::Paused {
                        return Err(Error::OperationNotPaused(id.to_string()));
                    }
                    entry.op.state = OperationState::Completed;
                    entry.op.pause_reason = None;
                    entry.op.completed_at = Some(Utc::now());
                    entry.op.touch();
                    let message = match comment {
                        Some(comment) => {
                            format!("Operation marked complete by operator: {comment}")
                        }
                        None => "Operation marked complete by operator".to_string(),
                    };
                    let event = EngineInner::make_event(
                        entry,
                        EventType::OperationMarkedComplete,
                        message,
                        None,
                    );
                    (entry.op.clone(), vec![event])
                };
                self.inner.persist(&op_clone, &events).await?;
                self.inner.notify_completed(&op_clone).await;
                Ok(())
            }
        }
    }

    /// Delete an operation; only `created` operations unless forced.
    pub async fn delete_operation(&self, id: &str, force: bool) -> Result<()> {
        {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
            if entry.op.state != OperationState::Created && !force {
                return Err(Error::CannotDelete(id.to_string()));
            }
            if let Some(cancel) = &entry.cancel {
                let _ = cancel.send(true);
            }
            registry.remove(id);
        }
        self.inner.store.delete_operation(id).await?;
        info!(operation_id = %id, force = force, "Operation deleted");
        Ok(())
    }

    /// Rewind to `step_index`, clearing every step from there on, and leave
    /// the operation paused for a manual resume. Used to retry after manual
    /// repair.
    pub async fn reset_operation(&self, id: &str, step_index: usize) -> Result<()> {
        let (op_clone, events) = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

            if matches!(
                entry.op.state,
                OperationState::Running | OperationState::RollingBack
            ) {
                return Err(Error::InvalidState(
                    "pause the operation before resetting it".into(),
                ));
            }
            if step_index >= entry.op.steps.len() {
                return Err(Error::InvalidParameter(format!(
                    "step_index: {} out of bounds for {} steps",
                    step_index,
                    entry.op.steps.len()
                )));
            }

            for step in &mut entry.op.steps[step_index..] {
                step.reset();
            }
            entry.op.current_step_index = step_index;
            entry.op.state = OperationState::Paused;
            entry.op.pause_reason = Some(format!(
                "Reset to step {step_index}. Resume with continue when ready."
            ));
            entry.op.error = None;
            entry.op.completed_at = None;
            entry.op.touch();
            let event = EngineInner::make_event(
                entry,
                EventType::OperationReset,
                format!("Operation reset to step {step_index}"),
                Some(json!({ "step_index": step_index })),
            );
            (entry.op.clone(), vec![event])
        };
        self.inner.persist(&op_clone, &events).await?;
        Ok(())
    }

    /// Replace the auto-pause set. Indices pointing at completed steps are
    /// dropped silently; out-of-bounds indices are rejected.
    pub async fn set_pause_before_steps(&self, id: &str, indices: &[usize]) -> Result<()> {
        let (op_clone, events) = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

            match entry.op.state {
                OperationState::Created | OperationState::Paused | OperationState::Running => {}
                other => {
                    return Err(Error::InvalidState(format!(
                        "cannot update pause steps in state '{other}'"
                    )));
                }
            }
            for &idx in indices {
                if idx >= entry.op.steps.len() {
                    return Err(Error::InvalidParameter(format!(
                        "pause_before_steps: index {idx} out of bounds for {} steps",
                        entry.op.steps.len()
                    )));
                }
            }
            let set: BTreeSet<usize> = indices
                .iter()
                .copied()
                .filter(|&idx| entry.op.steps[idx].state != StepState::Completed)
                .collect();
            entry.op.pause_before_steps = set.clone();
            entry.op.touch();
            let event = EngineInner::make_event(
                entry,
                EventType::PauseStepsUpdated,
                format!("Auto-pause steps updated ({} indices)", set.len()),
                Some(json!({ "indices": set })),
            );
            (entry.op.clone(), vec![event])
        };
        self.inner.persist(&op_clone, &events).await?;
        Ok(())
    }

    /// Update the per-operation wait budget (seconds; 0 restores the engine
    /// default).
    pub async fn update_wait_timeout(&self, id: &str, seconds: u64) -> Result<()> {
        let (op_clone, events) = {
            let mut registry = self.inner.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
            entry.op.wait_timeout_secs = seconds;
            entry.op.touch();
            let event = EngineInner::make_event(
                entry,
                EventType::TimeoutUpdated,
                format!("Wait timeout updated to {seconds}s"),
                Some(json!({ "wait_timeout_secs": seconds })),
            );
            (entry.op.clone(), vec![event])
        };
        self.inner.persist(&op_clone, &events).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        let registry = self.inner.registry.read().await;
        registry
            .get(id)
            .map(|e| e.op.clone())
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    pub async fn list_operations(&self) -> Vec<Operation> {
        let registry = self.inner.registry.read().await;
        let mut ops: Vec<Operation> = registry.values().map(|e| e.op.clone()).collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        ops
    }

    pub async fn get_events(&self, id: &str) -> Result<Vec<Event>> {
        let registry = self.inner.registry.read().await;
        registry
            .get(id)
            .map(|e| e.events.clone())
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }
}
