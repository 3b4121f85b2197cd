//! RDS Maintenance Machine - Library
//!
//! Resumable maintenance operations against managed database clusters:
//! instance type changes, storage type changes, instance cycling, and
//! engine major-version upgrades via blue/green deployments.
//!
//! ## Architecture
//!
//! - [`types`] - domain model: operations, steps, events, parameters
//! - [`plan`] - builders that turn a request plus cluster introspection
//!   into an ordered step list
//! - [`handlers`] - side-effectful step implementations over the
//!   [`provider::ProviderClient`] capability
//! - [`engine`] - registry, step-execution loop, retries, pause/resume,
//!   auto-pause, rollback, crash recovery
//! - [`store`] - append-only event log + crash-atomic operation snapshots
//! - [`executor`] - step-at-a-time driver for external schedulers
//! - [`notifier`] - lifecycle hooks for external observers

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod notifier;
pub mod plan;
pub mod provider;
pub mod status;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use engine::{Engine, RecoverySummary};
pub use error::{Error, Result};
pub use executor::{PollResult, StepExecutionResult, StepExecutor};
pub use notifier::{LogNotifier, Notifier, NullNotifier};
pub use provider::{ProviderClient, ProviderError, ProviderManager};
pub use store::{FileStore, NullStore, OperationStore};
pub use types::{
    CreateOperationRequest, Event, EventType, InterventionAction, Operation, OperationKind,
    OperationState, Step, StepState,
};
