//! Lifecycle hooks for external observers.
//!
//! The engine calls the notifier after each corresponding state transition.
//! Delivery failures are logged by the engine and never block the state
//! machine.

use async_trait::async_trait;
use tracing::info;

use crate::types::{Operation, Step};

/// Observer of operation lifecycle transitions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn operation_started(&self, op: &Operation) -> anyhow::Result<()>;
    async fn operation_completed(&self, op: &Operation) -> anyhow::Result<()>;
    async fn operation_failed(&self, op: &Operation, error: &str) -> anyhow::Result<()>;
    async fn operation_paused(&self, op: &Operation, reason: &str) -> anyhow::Result<()>;
    async fn step_completed(&self, op: &Operation, step: &Step) -> anyhow::Result<()>;
}

/// Drops every notification.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn operation_started(&self, _op: &Operation) -> anyhow::Result<()> {
        Ok(())
    }
    async fn operation_completed(&self, _op: &Operation) -> anyhow::Result<()> {
        Ok(())
    }
    async fn operation_failed(&self, _op: &Operation, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn operation_paused(&self, _op: &Operation, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn step_completed(&self, _op: &Operation, _step: &Step) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Mirrors lifecycle transitions to the structured log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn operation_started(&self, op: &Operation) -> anyhow::Result<()> {
        info!(
            operation_id = %op.id,
            kind = %op.kind,
            cluster_id = %op.cluster_id,
            "Operation started"
        );
        Ok(())
    }

    async fn operation_completed(&self, op: &Operation) -> anyhow::Result<()> {
        info!(operation_id = %op.id, kind = %op.kind, "Operation completed");
        Ok(())
    }

    async fn operation_failed(&self, op: &Operation, error: &str) -> anyhow::Result<()> {
        info!(operation_id = %op.id, error = %error, "Operation failed");
        Ok(())
    }

    async fn operation_paused(&self, op: &Operation, reason: &str) -> anyhow::Result<()> {
        info!(operation_id = %op.id, reason = %reason, "Operation paused");
        Ok(())
    }

    async fn step_completed(&self, op: &Operation, step: &Step) -> anyhow::Result<()> {
        info!(
            operation_id = %op.id,
            step = %step.name,
            action = %step.action,
            "Step completed"
        );
        Ok(())
    }
}
