//! File-backed reference store.
//!
//! Layout under the data directory:
//!
//! ```text
//! operations/
//!   <operation-id>/
//!     operation.json
//!     events/
//!       0001-<timestamp>-<type>.json
//!       0002-...
//! ```
//!
//! Every write lands on a sibling `.tmp-<uuid>` name, is flushed to stable
//! storage, and is renamed into place, so a crash can never leave a partial
//! record where a reader will find it. `load_all` removes orphaned temp
//! files and skips entries it cannot decode instead of failing recovery.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{OperationStore, RecoveryReport, SkippedEntry};
use crate::types::{Event, Operation};

const OPERATION_FILE: &str = "operation.json";
const EVENTS_DIR: &str = "events";

pub struct FileStore {
    data_dir: PathBuf,
    /// Rename is atomic per file; this only keeps concurrent writers from
    /// interleaving directory creation and temp-name churn.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn operations_dir(&self) -> PathBuf {
        self.data_dir.join("operations")
    }

    fn operation_dir(&self, id: &str) -> PathBuf {
        self.operations_dir().join(id)
    }

    fn events_dir(&self, id: &str) -> PathBuf {
        self.operation_dir(id).join(EVENTS_DIR)
    }

    /// Write-to-temp, fsync, rename.
    async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Store(format!("no parent directory for {}", path.display())))?;
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn is_orphan_name(name: &str) -> bool {
        name.starts_with(".tmp-") || name.ends_with(".tmp")
    }

    /// Remove leftover temp files from interrupted writes.
    async fn sweep_orphans(dir: &Path) {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::is_orphan_name(&name) {
                debug!(path = %entry.path().display(), "Removing orphaned temp file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    fn event_file_name(event: &Event) -> String {
        let ts = event.timestamp.format("%Y-%m-%dT%H-%M-%S%.3fZ");
        format!(
            "{:04}-{}-{}.json",
            event.sequence,
            ts,
            sanitize(&event.event_type.to_string())
        )
    }

    /// Decoded events plus the bookkeeping recovery needs: total entry count
    /// and the highest sequence seen among decodable entries.
    async fn read_events(&self, id: &str) -> Result<(Vec<Event>, u64, u64, Vec<SkippedEntry>)> {
        let dir = self.events_dir(id);
        let mut names: Vec<String> = Vec::new();
        match fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !Self::is_orphan_name(&name) {
                        names.push(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), 0, 0, Vec::new()));
            }
            Err(e) => return Err(e.into()),
        }
        // The zero-padded sequence prefix makes lexicographic order the
        // append order.
        names.sort();

        let mut events = Vec::new();
        let mut skipped = Vec::new();
        let mut max_sequence = 0u64;
        let total = names.len() as u64;
        for name in names {
            let path = dir.join(&name);
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Event>(&bytes) {
                    Ok(event) => {
                        max_sequence = max_sequence.max(event.sequence);
                        events.push(event);
                    }
                    Err(e) => skipped.push(SkippedEntry {
                        path: path.display().to_string(),
                        reason: format!("undecodable event: {e}"),
                    }),
                },
                Err(e) => skipped.push(SkippedEntry {
                    path: path.display().to_string(),
                    reason: format!("unreadable event: {e}"),
                }),
            }
        }
        Ok((events, total, max_sequence, skipped))
    }
}

/// Strip path-unsafe characters from an event type tag.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl OperationStore for FileStore {
    async fn save_operation(&self, op: &Operation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.operation_dir(&op.id);
        fs::create_dir_all(dir.join(EVENTS_DIR)).await?;
        let bytes = serde_json::to_vec_pretty(op)?;
        Self::atomic_write(&dir.join(OPERATION_FILE), &bytes).await
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        let path = self.operation_dir(id).join(OPERATION_FILE);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        Ok(self.load_all().await?.operations)
    }

    async fn delete_operation(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(self.operation_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.events_dir(&event.operation_id);
        fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(event)?;
        Self::atomic_write(&dir.join(Self::event_file_name(event)), &bytes).await
    }

    async fn get_events(&self, operation_id: &str) -> Result<Vec<Event>> {
        let (events, _, _, skipped) = self.read_events(operation_id).await?;
        for skip in &skipped {
            warn!(path = %skip.path, reason = %skip.reason, "Skipping event entry");
        }
        Ok(events)
    }

    async fn load_all(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let ops_dir = self.operations_dir();
        let mut entries = match fs::read_dir(&ops_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();

            Self::sweep_orphans(&dir).await;
            Self::sweep_orphans(&dir.join(EVENTS_DIR)).await;

            let op_path = dir.join(OPERATION_FILE);
            let operation = match fs::read(&op_path).await {
                Ok(bytes) => match serde_json::from_slice::<Operation>(&bytes) {
                    Ok(op) => match op.validate() {
                        Ok(()) => Some(op),
                        Err(e) => {
                            report.skipped.push(SkippedEntry {
                                path: op_path.display().to_string(),
                                reason: format!("invalid operation: {e}"),
                            });
                            None
                        }
                    },
                    Err(e) => {
                        report.skipped.push(SkippedEntry {
                            path: op_path.display().to_string(),
                            reason: format!("undecodable operation: {e}"),
                        });
                        None
                    }
                },
                Err(e) => {
                    report.skipped.push(SkippedEntry {
                        path: op_path.display().to_string(),
                        reason: format!("unreadable operation: {e}"),
                    });
                    None
                }
            };

            let (events, total, max_sequence, skipped) = self.read_events(&id).await?;
            report.skipped.extend(skipped);
            // Counting corrupted entries too keeps the next sequence ahead of
            // anything ever written, even entries we could not read back.
            report
                .event_sequences
                .insert(id.clone(), total.max(max_sequence));
            report.events.insert(id.clone(), events);

            if let Some(op) = operation {
                report.operations.push(op);
            }
        }

        for skip in &report.skipped {
            warn!(path = %skip.path, reason = %skip.reason, "Skipping corrupt store entry");
        }
        Ok(report)
    }
}
