use std::path::PathBuf;

use anyhow::{Context, Result};
use change_log_core::{now_utc, timestamp, CharacterId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::write_json_atomic;

pub const HEALTH_JOURNAL_MAX_OPERATIONS: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthOperation {
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub operation: String,
    #[serde(default)]
    pub character_id: Option<CharacterId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSummary {
    pub total_operations: u64,
    pub error_count: u64,
    pub rotation_count: u64,
    pub cleanup_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthJournalFile {
    pub summary: HealthSummary,
    pub operations: Vec<HealthOperation>,
}

/// `storage_health.json`: a capped journal of store operations plus a rolling
/// summary that survives eviction.
#[derive(Debug)]
pub struct HealthJournal {
    path: PathBuf,
    capacity: usize,
    guard: Mutex<()>,
}

impl HealthJournal {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::with_capacity(path, HEALTH_JOURNAL_MAX_OPERATIONS)
    }

    #[must_use]
    pub fn with_capacity(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            capacity: capacity.max(1),
            guard: Mutex::new(()),
        }
    }

    /// Records one operation. Journal failures are logged, never returned:
    /// bookkeeping must not fail the operation it describes.
    pub async fn record(
        &self,
        operation: &str,
        character_id: Option<CharacterId>,
        success: bool,
        details: Map<String, Value>,
    ) {
        if let Err(err) = self
            .try_record(operation, character_id, success, details)
            .await
        {
            warn!(operation, error = %err, "failed to update storage health journal");
        }
    }

    async fn try_record(
        &self,
        operation: &str,
        character_id: Option<CharacterId>,
        success: bool,
        details: Map<String, Value>,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut journal = self.load_unlocked().await?;

        journal.summary.total_operations += 1;
        if !success {
            journal.summary.error_count += 1;
        }
        match operation {
            "rotate" => journal.summary.rotation_count += 1,
            "cleanup" => journal.summary.cleanup_count += 1,
            _ => {}
        }

        journal.operations.push(HealthOperation {
            timestamp: now_utc(),
            operation: operation.to_string(),
            character_id,
            success,
            details,
        });
        if journal.operations.len() > self.capacity {
            let excess = journal.operations.len() - self.capacity;
            journal.operations.drain(..excess);
        }

        write_json_atomic(&self.path, &journal).await
    }

    pub async fn load(&self) -> Result<HealthJournalFile> {
        let _guard = self.guard.lock().await;
        self.load_unlocked().await
    }

    async fn load_unlocked(&self) -> Result<HealthJournalFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(journal) => Ok(journal),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "storage health journal unreadable; starting fresh");
                    Ok(HealthJournalFile::default())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(HealthJournalFile::default())
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[tokio::test]
    async fn journal_is_capped_but_summary_keeps_counting() {
        let dir = std::env::temp_dir().join(format!("change-log-journal-{}", Ulid::new()));
        let journal = HealthJournal::with_capacity(dir.join("storage_health.json"), 10);

        for index in 0..15 {
            let operation = if index % 2 == 0 { "append" } else { "rotate" };
            journal
                .record(operation, Some(CharacterId(1)), index != 3, Map::new())
                .await;
        }

        let loaded = must(journal.load().await);
        assert_eq!(loaded.operations.len(), 10);
        assert_eq!(loaded.operations[0].operation, "rotate");
        assert_eq!(loaded.summary.total_operations, 15);
        assert_eq!(loaded.summary.error_count, 1);
        assert_eq!(loaded.summary.rotation_count, 7);
        assert_eq!(loaded.summary.cleanup_count, 0);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
