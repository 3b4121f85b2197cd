//! Persistence capability: operation snapshots plus an append-only event log.
//!
//! The engine's in-memory registry is authoritative at runtime; the store is
//! the durable copy used for crash recovery. Implementations must make
//! `save_operation` crash-atomic and must tolerate corrupted entries on
//! `load_all` (skip and report, never abort recovery).

mod file;

pub use file::FileStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Event, Operation};

/// One entry `load_all` could not decode or validate.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

/// Everything recovered from durable storage.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub operations: Vec<Operation>,
    /// Decoded events per operation, ordered by append sequence
    pub events: HashMap<String, Vec<Event>>,
    /// Last-used sequence number per operation. Counted over every entry
    /// found, corrupted ones included, so a replay never reuses a sequence.
    pub event_sequences: HashMap<String, u64>,
    pub skipped: Vec<SkippedEntry>,
}

/// Durable storage for operations and their event logs.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Overwrite the canonical snapshot for the operation id. Crash-atomic.
    async fn save_operation(&self, op: &Operation) -> Result<()>;

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>>;

    async fn list_operations(&self) -> Result<Vec<Operation>>;

    /// Remove the snapshot and the operation's whole event log.
    async fn delete_operation(&self, id: &str) -> Result<()>;

    /// Durable append to the operation's log.
    async fn append_event(&self, event: &Event) -> Result<()>;

    /// Events ordered by append sequence.
    async fn get_events(&self, operation_id: &str) -> Result<Vec<Event>>;

    /// Recover the entire registry from durable storage.
    async fn load_all(&self) -> Result<RecoveryReport>;
}

/// Store that drops all writes and returns empty results. Used by tests and
/// step-at-a-time mode where durability is the caller's concern.
pub struct NullStore;

#[async_trait]
impl OperationStore for NullStore {
    async fn save_operation(&self, _op: &Operation) -> Result<()> {
        Ok(())
    }

    async fn get_operation(&self, _id: &str) -> Result<Option<Operation>> {
        Ok(None)
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    async fn delete_operation(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn append_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn get_events(&self, _operation_id: &str) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn load_all(&self) -> Result<RecoveryReport> {
        Ok(RecoveryReport::default())
    }
}
