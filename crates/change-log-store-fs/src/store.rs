use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use change_log_core::{
    format_compact, now_utc, timestamp, ChangeLogConfig, ChangeLogEntry, ChangeLogFile,
    CharacterId,
};
use serde::Serialize;
use serde_json::{json, Map};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::atomic::{move_file, write_atomic};
use crate::journal::HealthJournal;
use crate::locator::{
    rotation_number, LogFileInfo, LogFileKind, LogFileSet, LogLocator, ROTATED_DIR,
};

const SECONDS_PER_DAY: u64 = 86_400;

/// In-process write locks keyed by character id. Held for the whole
/// load-modify-save of any rewrite of that character's files.
#[derive(Debug, Default)]
struct CharacterLocks {
    locks: Mutex<HashMap<CharacterId, Arc<Mutex<()>>>>,
}

impl CharacterLocks {
    async fn acquire(&self, character_id: CharacterId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(character_id).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppendReceipt {
    pub path: PathBuf,
    pub appended: usize,
    pub total_entries: usize,
    pub rotated_to: Option<PathBuf>,
    pub migrated_from: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RotationOutcome {
    pub character_id: CharacterId,
    pub rotated: bool,
    pub rotated_path: Option<PathBuf>,
    pub rotation_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub processed: usize,
    pub archived: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CharacterStatistics {
    pub character_id: CharacterId,
    pub total_entries: usize,
    pub total_files: usize,
    pub total_size: u64,
    #[serde(with = "timestamp::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(with = "timestamp::option")]
    pub newest: Option<OffsetDateTime>,
    pub category_counts: BTreeMap<String, usize>,
}

/// Result of inspecting one log file during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCheck {
    Valid,
    Repaired { previous_total: usize, actual: usize },
    Corrupted(String),
}

/// Change logs stored as one JSON document per character plus rotated
/// snapshots. All rewrites are atomic and serialized per character.
#[derive(Debug)]
pub struct ChangeLogStore {
    config: ChangeLogConfig,
    locator: LogLocator,
    locks: CharacterLocks,
    health: HealthJournal,
}

impl ChangeLogStore {
    /// Opens a store over `config.storage_dir`, creating it if needed.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or the storage
    /// directory cannot be created.
    pub async fn open(config: ChangeLogConfig) -> Result<Self> {
        config
            .validate()
            .context("invalid change log configuration")?;
        tokio::fs::create_dir_all(&config.storage_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create storage directory {}",
                    config.storage_dir.display()
                )
            })?;

        let locator = LogLocator::new(&config.storage_dir);
        let health = HealthJournal::new(locator.health_journal_path());
        Ok(Self {
            config,
            locator,
            locks: CharacterLocks::default(),
            health,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ChangeLogConfig {
        &self.config
    }

    #[must_use]
    pub fn locator(&self) -> &LogLocator {
        &self.locator
    }

    #[must_use]
    pub fn health_journal(&self) -> &HealthJournal {
        &self.health
    }

    /// Appends entries to the character's current file, then rotates it if
    /// it crossed the size threshold. Returns once the rename has landed.
    ///
    /// # Errors
    /// Returns an error for oversized batches, entries for another
    /// character, a corrupted current file, or any I/O failure. The live file
    /// is untouched on error.
    pub async fn append(
        &self,
        character_id: CharacterId,
        character_name: &str,
        entries: &[ChangeLogEntry],
    ) -> Result<AppendReceipt> {
        if entries.len() > self.config.max_entries_per_batch {
            bail!(
                "batch of {} entries exceeds max_entries_per_batch {}",
                entries.len(),
                self.config.max_entries_per_batch
            );
        }
        if let Some(foreign) = entries
            .iter()
            .find(|entry| entry.character_id != character_id)
        {
            bail!(
                "entry for character {} cannot be appended to character {character_id}",
                foreign.character_id
            );
        }

        let _lock = self.locks.acquire(character_id).await;
        let result = self
            .append_locked(character_id, character_name, entries)
            .await;

        let mut details = Map::new();
        details.insert("entries".to_string(), json!(entries.len()));
        if let Err(err) = &result {
            details.insert("error".to_string(), json!(format!("{err:#}")));
        }
        self.health
            .record("append", Some(character_id), result.is_ok(), details)
            .await;
        result
    }

    async fn append_locked(
        &self,
        character_id: CharacterId,
        character_name: &str,
        entries: &[ChangeLogEntry],
    ) -> Result<AppendReceipt> {
        let (path, migrated_from) = self
            .prepare_current_path(character_id, character_name)
            .await?;

        if entries.is_empty() {
            return Ok(AppendReceipt {
                path,
                appended: 0,
                total_entries: 0,
                rotated_to: None,
                migrated_from,
            });
        }

        let mut file = match read_log_file(&path).await? {
            Some(file) => file,
            None => ChangeLogFile::new(
                character_id,
                character_name,
                self.config.retention_days,
                self.last_rotation(character_id).await?,
            ),
        };
        if !character_name.trim().is_empty() {
            file.metadata.character_name = character_name.to_string();
        }
        file.metadata.retention_policy_days = self.config.retention_days;
        file.entries.extend_from_slice(entries);
        file.recount(now_utc());
        save_log_file(&path, &mut file).await?;
        debug!(
            character_id = %character_id,
            path = %path.display(),
            appended = entries.len(),
            "appended change log entries"
        );

        let total_entries = file.metadata.total_entries;
        let rotated_to = if file.metadata.log_file_size >= self.config.rotation_threshold_bytes() {
            Some(self.rotate_locked(character_id, &path, file).await?)
        } else {
            None
        };

        Ok(AppendReceipt {
            path,
            appended: entries.len(),
            total_entries,
            rotated_to,
            migrated_from,
        })
    }

    /// Resolves the preferred current path, renaming a legacy or
    /// differently-named file into place when the preferred one is absent.
    async fn prepare_current_path(
        &self,
        character_id: CharacterId,
        character_name: &str,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let files = self.locator.discover(character_id).await?;
        let name = if character_name.trim().is_empty() {
            self.known_name(&files).await.unwrap_or_default()
        } else {
            character_name.to_string()
        };
        let preferred = self.locator.current_path(character_id, &name);

        if tokio::fs::try_exists(&preferred).await.unwrap_or(false) {
            return Ok((preferred, None));
        }

        let candidate = files
            .current
            .iter()
            .chain(files.legacy.iter())
            .find(|path| **path != preferred)
            .cloned();
        let Some(candidate) = candidate else {
            return Ok((preferred, None));
        };

        tokio::fs::rename(&candidate, &preferred)
            .await
            .with_context(|| {
                format!(
                    "failed to migrate {} to {}",
                    candidate.display(),
                    preferred.display()
                )
            })?;
        info!(
            character_id = %character_id,
            from = %candidate.display(),
            to = %preferred.display(),
            "migrated change log to current naming scheme"
        );
        Ok((preferred, Some(candidate)))
    }

    /// Highest rotation number already used by the character, live or
    /// archived, so a fresh current file continues the sequence.
    async fn last_rotation(&self, character_id: CharacterId) -> Result<u32> {
        let live = self.locator.discover(character_id).await?;
        let archived = self.locator.discover_archived(character_id).await?;

        let mut last = live
            .rotated
            .iter()
            .chain(archived.rotated.iter())
            .filter_map(|path| rotation_number(path.as_path()))
            .max()
            .unwrap_or(0);
        for path in archived.current.iter().chain(archived.legacy.iter()) {
            if let Ok(Some(file)) = read_log_file(path).await {
                last = last.max(file.metadata.rotation_count);
            }
        }
        Ok(last)
    }

    async fn known_name(&self, files: &LogFileSet) -> Option<String> {
        for path in files.current.iter().chain(files.legacy.iter()) {
            if let Ok(Some(file)) = read_log_file(path).await {
                if !file.metadata.character_name.trim().is_empty() {
                    return Some(file.metadata.character_name);
                }
            }
        }
        None
    }

    /// Rotates the character's current file if it is at or above the size
    /// threshold. Below the threshold this is a successful no-op.
    ///
    /// # Errors
    /// Returns an error when the current file is corrupted or I/O fails.
    pub async fn rotate(&self, character_id: CharacterId) -> Result<RotationOutcome> {
        let _lock = self.locks.acquire(character_id).await;
        let files = self.locator.discover(character_id).await?;
        let Some(path) = files.current.first().or(files.legacy.first()).cloned() else {
            return Ok(RotationOutcome {
                character_id,
                rotated: false,
                rotated_path: None,
                rotation_count: 0,
            });
        };

        let size = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let Some(file) = read_log_file(&path).await? else {
            bail!("change log {} disappeared during rotation", path.display());
        };

        if size < self.config.rotation_threshold_bytes() {
            return Ok(RotationOutcome {
                character_id,
                rotated: false,
                rotated_path: None,
                rotation_count: file.metadata.rotation_count,
            });
        }

        let rotation_count = file.metadata.rotation_count + 1;
        let rotated_path = self.rotate_locked(character_id, &path, file).await?;
        Ok(RotationOutcome {
            character_id,
            rotated: true,
            rotated_path: Some(rotated_path),
            rotation_count,
        })
    }

    /// Writes `file` as the next rotated snapshot and replaces the current
    /// file with an empty one carrying the new rotation count. Caller holds
    /// the character lock.
    async fn rotate_locked(
        &self,
        character_id: CharacterId,
        current_path: &Path,
        mut file: ChangeLogFile,
    ) -> Result<PathBuf> {
        file.metadata.rotation_count += 1;
        let rotation_count = file.metadata.rotation_count;
        let character_name = file.metadata.character_name.clone();

        let stamp = format_compact(now_utc())?;
        let rotated_path = self
            .locator
            .rotated_dir(character_id, &character_name)
            .join(format!("changes_{stamp}_r{rotation_count:03}.json"));
        save_log_file(&rotated_path, &mut file)
            .await
            .context("failed to write rotated change log")?;

        let mut fresh = ChangeLogFile::new(
            character_id,
            character_name,
            self.config.retention_days,
            rotation_count,
        );
        save_log_file(current_path, &mut fresh)
            .await
            .context("failed to reset current change log after rotation")?;

        info!(
            character_id = %character_id,
            rotated_path = %rotated_path.display(),
            rotation_count,
            "rotated change log"
        );
        let mut details = Map::new();
        details.insert("rotation_count".to_string(), json!(rotation_count));
        details.insert(
            "rotated_path".to_string(),
            json!(rotated_path.display().to_string()),
        );
        self.health
            .record("rotate", Some(character_id), true, details)
            .await;
        Ok(rotated_path)
    }

    /// Archives or deletes every log file whose mtime is older than
    /// `now - retention_days`. Per-file failures are logged and counted in
    /// the report; the sweep never fails as a whole.
    pub async fn cleanup(&self, retention_days: u32) -> CleanupReport {
        self.cleanup_as_of(retention_days, SystemTime::now()).await
    }

    /// [`Self::cleanup`] against an explicit clock. A file whose mtime equals
    /// the cutoff is kept.
    pub async fn cleanup_as_of(&self, retention_days: u32, now: SystemTime) -> CleanupReport {
        let mut report = CleanupReport::default();
        let retention = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);
        let Some(cutoff) = now.checked_sub(retention) else {
            return report;
        };

        let files = match self.locator.list_all().await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "failed to list change logs for cleanup");
                report.errors.push(format!("{err:#}"));
                return report;
            }
        };

        for info in files {
            let Some(modified) = info.modified else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }

            let _lock = match info.character_id {
                Some(character_id) => Some(self.locks.acquire(character_id).await),
                None => None,
            };
            match self.expire_file(&info.path).await {
                Ok(archived) => {
                    report.processed += 1;
                    if archived {
                        report.archived += 1;
                    } else {
                        report.deleted += 1;
                    }
                }
                Err(err) => {
                    warn!(path = %info.path.display(), error = %err, "failed to expire change log");
                    report.errors.push(format!("{}: {err:#}", info.path.display()));
                }
            }
        }

        let mut details = Map::new();
        details.insert("processed".to_string(), json!(report.processed));
        details.insert("retention_days".to_string(), json!(retention_days));
        self.health
            .record("cleanup", None, report.errors.is_empty(), details)
            .await;
        info!(
            processed = report.processed,
            archived = report.archived,
            deleted = report.deleted,
            "change log retention sweep finished"
        );
        report
    }

    async fn expire_file(&self, path: &Path) -> Result<bool> {
        if self.config.backup_old_logs {
            let stamp = format_compact(now_utc())?;
            let target = self.locator.unique_archive_path_for(path, &stamp).await?;
            move_file(path, &target).await?;
            debug!(from = %path.display(), to = %target.display(), "archived change log");
            Ok(true)
        } else {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("failed to delete {}", path.display()))?;
            debug!(path = %path.display(), "deleted change log");
            Ok(false)
        }
    }

    /// Entries from the current, legacy and rotated files, newest first.
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error when the storage directory cannot be listed.
    pub async fn read(
        &self,
        character_id: CharacterId,
        since: Option<OffsetDateTime>,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let files = self.locator.discover(character_id).await?;
        let mut entries = Vec::new();
        for path in files.all() {
            match read_log_file(&path).await {
                Ok(Some(file)) => entries.extend(file.entries),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable change log");
                }
            }
        }

        if let Some(since) = since {
            entries.retain(|entry| entry.timestamp >= since);
        }
        entries.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the storage directory cannot be listed.
    pub async fn statistics(&self, character_id: CharacterId) -> Result<CharacterStatistics> {
        let files = self.locator.discover(character_id).await?;
        let mut stats = CharacterStatistics {
            character_id,
            total_entries: 0,
            total_files: 0,
            total_size: 0,
            oldest: None,
            newest: None,
            category_counts: BTreeMap::new(),
        };

        for path in files.all() {
            let size = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => continue,
            };
            stats.total_files += 1;
            stats.total_size += size;

            let Ok(Some(file)) = read_log_file(&path).await else {
                continue;
            };
            for entry in &file.entries {
                stats.total_entries += 1;
                *stats
                    .category_counts
                    .entry(entry.change.category.as_str().to_string())
                    .or_insert(0) += 1;
                stats.oldest = Some(stats.oldest.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
                stats.newest = Some(stats.newest.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
            }
        }
        Ok(stats)
    }

    /// Every log file in the store.
    ///
    /// # Errors
    /// Returns an error when the storage directory cannot be listed.
    pub async fn list_files(&self) -> Result<Vec<LogFileInfo>> {
        self.locator.list_all().await
    }

    /// Characters with at least one current or legacy file.
    ///
    /// # Errors
    /// Returns an error when the storage directory cannot be listed.
    pub async fn characters(&self) -> Result<Vec<CharacterId>> {
        let mut ids: Vec<CharacterId> = self
            .list_files()
            .await?
            .into_iter()
            .filter(|info| info.kind != LogFileKind::Rotated)
            .filter_map(|info| info.character_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Loads the current file, applies `edit`, and saves it atomically, all
    /// under the character lock. `None` when the character has no file.
    ///
    /// # Errors
    /// Returns an error when the file is corrupted or I/O fails.
    pub async fn rewrite_current<R>(
        &self,
        character_id: CharacterId,
        edit: impl FnOnce(&mut ChangeLogFile) -> R,
    ) -> Result<Option<R>> {
        let _lock = self.locks.acquire(character_id).await;
        let files = self.locator.discover(character_id).await?;
        let Some(path) = files.current.first().or(files.legacy.first()).cloned() else {
            return Ok(None);
        };
        let Some(mut file) = read_log_file(&path).await? else {
            return Ok(None);
        };

        let result = edit(&mut file);
        file.recount(now_utc());
        save_log_file(&path, &mut file).await?;
        Ok(Some(result))
    }

    /// Checks one file for corruption and repairs header counter drift in
    /// place.
    ///
    /// # Errors
    /// Returns an error only for I/O failures; undecodable files are reported
    /// as [`FileCheck::Corrupted`] and left untouched.
    pub async fn check_and_repair(&self, path: &Path) -> Result<FileCheck> {
        let _lock = match self.locator.owner_of(path) {
            Some(character_id) => Some(self.locks.acquire(character_id).await),
            None => None,
        };

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut file = match ChangeLogFile::decode(&bytes) {
            Ok(file) => file,
            Err(err) => return Ok(FileCheck::Corrupted(err.to_string())),
        };
        if !file.has_metadata_drift() {
            return Ok(FileCheck::Valid);
        }

        let previous_total = file.metadata.total_entries;
        let last_updated = file.metadata.last_updated;
        file.recount(last_updated);
        save_log_file(path, &mut file).await?;
        warn!(
            path = %path.display(),
            previous_total,
            actual = file.entries.len(),
            "repaired change log metadata drift"
        );
        Ok(FileCheck::Repaired {
            previous_total,
            actual: file.entries.len(),
        })
    }

    /// Whether `path` sits in a character's `rotated/` directory.
    #[must_use]
    pub fn is_rotated(path: &Path) -> bool {
        path.parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == ROTATED_DIR)
    }
}

/// Reads and decodes a log file. `Ok(None)` when the file does not exist.
pub(crate) async fn read_log_file(path: &Path) -> Result<Option<ChangeLogFile>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    ChangeLogFile::decode(&bytes)
        .map(Some)
        .with_context(|| format!("corrupted change log {}", path.display()))
}

async fn save_log_file(path: &Path, file: &mut ChangeLogFile) -> Result<()> {
    let bytes = file
        .encode()
        .with_context(|| format!("failed to encode {}", path.display()))?;
    write_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use change_log_core::{
        parse_rfc3339_utc, ChangeCategory, ChangeType, FieldChange,
    };
    use proptest::prelude::*;
    use std::fs::File;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(value) => value,
            None => panic!("test failure: expected Some(..)"),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("change-log-store-{}", Ulid::new()))
    }

    fn config_in(dir: &Path) -> ChangeLogConfig {
        ChangeLogConfig::default().with_storage_dir(dir)
    }

    fn entry(character_id: u64, path: &str, category: ChangeCategory, at: &str) -> ChangeLogEntry {
        let timestamp = must(parse_rfc3339_utc(at).map_err(anyhow::Error::from));
        let mut change = FieldChange::new(path, json!(1), json!(2), ChangeType::Incremented, category);
        change.detection_timestamp = timestamp;
        ChangeLogEntry::new(change, CharacterId(character_id), "Vex", timestamp)
    }

    fn set_mtime(path: &Path, at: SystemTime) {
        let file = must(File::options().write(true).open(path).map_err(anyhow::Error::from));
        must(file.set_modified(at).map_err(anyhow::Error::from));
    }

    #[tokio::test]
    async fn append_then_read_returns_entries_newest_first() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);
        let batch = vec![
            entry(42, "combat.armor_class", ChangeCategory::Combat, "2026-02-07T12:00:00Z"),
            entry(42, "skills.arcana", ChangeCategory::Skills, "2026-02-07T13:00:00Z"),
        ];

        let receipt = must(store.append(CharacterId(42), "Vex", &batch).await);
        assert_eq!(receipt.path, dir.join("Vex_42_changes.json"));
        assert_eq!(receipt.total_entries, 2);
        assert!(receipt.rotated_to.is_none());

        let read = must(store.read(CharacterId(42), None, None).await);
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], batch[1]);
        assert_eq!(read[1], batch[0]);

        let since = must(parse_rfc3339_utc("2026-02-07T12:30:00Z").map_err(anyhow::Error::from));
        let recent = must(store.read(CharacterId(42), Some(since), None).await);
        assert_eq!(recent, vec![batch[1].clone()]);
        let limited = must(store.read(CharacterId(42), None, Some(1)).await);
        assert_eq!(limited.len(), 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn append_rejects_foreign_entries_and_oversized_batches() {
        let dir = temp_dir();
        let mut config = config_in(&dir);
        config.max_entries_per_batch = 1;
        let store = must(ChangeLogStore::open(config).await);

        let foreign = vec![entry(7, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
        assert!(store.append(CharacterId(42), "Vex", &foreign).await.is_err());

        let oversized = vec![
            entry(42, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z"),
            entry(42, "skills.history", ChangeCategory::Skills, "2026-02-07T12:00:00Z"),
        ];
        assert!(store.append(CharacterId(42), "Vex", &oversized).await.is_err());
        assert!(must(store.read(CharacterId(42), None, None).await).is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn crossing_the_threshold_rotates_exactly_once_per_crossing() {
        let dir = temp_dir();
        let mut config = config_in(&dir);
        config.rotation_size_mb = 0.002;
        let store = must(ChangeLogStore::open(config).await);

        let mut rotated_paths = Vec::new();
        let mut written = 0;
        for index in 0..12 {
            let batch = vec![entry(
                42,
                &format!("skills.skill_{index}"),
                ChangeCategory::Skills,
                &format!("2026-02-07T12:{index:02}:00Z"),
            )];
            let receipt = must(store.append(CharacterId(42), "Vex", &batch).await);
            written += 1;
            if let Some(path) = receipt.rotated_to {
                rotated_paths.push(path);
                assert_eq!(receipt.total_entries, written);
                written = 0;
            }
        }

        assert!(rotated_paths.len() >= 2);
        let mut counts = Vec::new();
        for path in &rotated_paths {
            let file = must_some(must(read_log_file(path).await));
            counts.push(file.metadata.rotation_count);
            let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
            assert!(must_some(name).ends_with(&format!("_r{:03}.json", file.metadata.rotation_count)));
        }
        assert!(counts.windows(2).all(|pair| pair[0] < pair[1]));

        let current = must_some(must(read_log_file(&dir.join("Vex_42_changes.json")).await));
        assert_eq!(current.metadata.rotation_count, *must_some(counts.last()));

        let everything = must(store.read(CharacterId(42), None, None).await);
        assert_eq!(everything.len(), 12);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn rotate_below_threshold_is_a_successful_noop() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);
        let batch = vec![entry(42, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
        must(store.append(CharacterId(42), "Vex", &batch).await);

        let outcome = must(store.rotate(CharacterId(42)).await);
        assert!(!outcome.rotated);
        assert_eq!(outcome.rotation_count, 0);

        let missing = must(store.rotate(CharacterId(99)).await);
        assert!(!missing.rotated);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn retention_keeps_the_cutoff_and_archives_older_files() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);
        for (id, name) in [(1, "Ada"), (2, "Bo")] {
            let batch = vec![entry(id, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
            must(store.append(CharacterId(id), name, &batch).await);
        }

        let now = SystemTime::now();
        let cutoff = must_some(now.checked_sub(Duration::from_secs(30 * SECONDS_PER_DAY)));
        set_mtime(&dir.join("Ada_1_changes.json"), cutoff);
        set_mtime(
            &dir.join("Bo_2_changes.json"),
            must_some(cutoff.checked_sub(Duration::from_secs(SECONDS_PER_DAY))),
        );

        let report = store.cleanup_as_of(30, now).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.archived, 1);
        assert!(report.errors.is_empty());
        assert!(dir.join("Ada_1_changes.json").exists());
        assert!(!dir.join("Bo_2_changes.json").exists());
        assert!(dir.join("archive").join("Bo_2_changes.json").exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    async fn age_everything(store: &ChangeLogStore, days: u64) {
        let old = must_some(SystemTime::now().checked_sub(Duration::from_secs(days * SECONDS_PER_DAY)));
        for info in must(store.locator().list_all().await) {
            set_mtime(&info.path, old);
        }
    }

    async fn rotate_once(store: &ChangeLogStore, label: &str) -> PathBuf {
        for index in 0..40 {
            let batch = vec![entry(
                42,
                &format!("skills.{label}_{index}"),
                ChangeCategory::Skills,
                "2026-02-07T12:00:00Z",
            )];
            let receipt = must(store.append(CharacterId(42), "Vex", &batch).await);
            if let Some(path) = receipt.rotated_to {
                return path;
            }
        }
        panic!("test failure: no rotation after 40 appends");
    }

    #[tokio::test]
    async fn repeated_retention_passes_keep_every_archive() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);

        for path in ["skills.first", "skills.second"] {
            let batch = vec![entry(1, path, ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
            must(store.append(CharacterId(1), "Ada", &batch).await);
            age_everything(&store, 40).await;
            let report = store.cleanup(30).await;
            assert_eq!(report.archived, 1);
            assert!(report.errors.is_empty());
        }

        let archived = must(store.locator().discover_archived(CharacterId(1)).await);
        assert_eq!(archived.current.len(), 2);
        let mut paths = Vec::new();
        for path in &archived.current {
            let file = must_some(must(read_log_file(path).await));
            paths.extend(file.entries.iter().map(|item| item.field_path().to_string()));
        }
        paths.sort();
        assert_eq!(paths, vec!["skills.first", "skills.second"]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn rotation_count_continues_after_archiving() {
        let dir = temp_dir();
        let mut config = config_in(&dir);
        config.rotation_size_mb = 0.002;
        let store = must(ChangeLogStore::open(config).await);

        let first = rotate_once(&store, "before").await;
        assert!(first.to_string_lossy().ends_with("_r001.json"));

        age_everything(&store, 40).await;
        let report = store.cleanup(30).await;
        assert_eq!(report.archived, 2);
        assert!(must(store.locator().discover(CharacterId(42)).await).is_empty());

        let batch = vec![entry(42, "skills.after", ChangeCategory::Skills, "2026-03-01T12:00:00Z")];
        let receipt = must(store.append(CharacterId(42), "Vex", &batch).await);
        let current = must_some(must(read_log_file(&receipt.path).await));
        assert_eq!(current.metadata.rotation_count, 1);

        let second = rotate_once(&store, "after").await;
        assert!(second.to_string_lossy().ends_with("_r002.json"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn retention_deletes_when_backups_are_disabled() {
        let dir = temp_dir();
        let mut config = config_in(&dir);
        config.backup_old_logs = false;
        let store = must(ChangeLogStore::open(config).await);
        let batch = vec![entry(1, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
        must(store.append(CharacterId(1), "Ada", &batch).await);

        let old = must_some(SystemTime::now().checked_sub(Duration::from_secs(40 * SECONDS_PER_DAY)));
        set_mtime(&dir.join("Ada_1_changes.json"), old);

        let report = store.cleanup(30).await;
        assert_eq!(report.deleted, 1);
        assert!(!dir.join("archive").exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn legacy_file_is_migrated_in_place_on_first_write() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);

        let mut legacy = ChangeLogFile::new(CharacterId(5), "", 365, 0);
        legacy
            .entries
            .push(entry(5, "skills.arcana", ChangeCategory::Skills, "2026-01-01T00:00:00Z"));
        legacy.recount(now_utc());
        let legacy_path = dir.join("character_5.json");
        must(save_log_file(&legacy_path, &mut legacy).await);

        let batch = vec![entry(5, "skills.history", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
        let receipt = must(store.append(CharacterId(5), "Quill", &batch).await);

        assert_eq!(receipt.migrated_from, Some(legacy_path.clone()));
        assert_eq!(receipt.path, dir.join("Quill_5_changes.json"));
        assert_eq!(receipt.total_entries, 2);
        assert!(!legacy_path.exists());

        let files = must(store.locator().discover(CharacterId(5)).await);
        assert_eq!(files.current.len(), 1);
        assert!(files.legacy.is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn statistics_cover_all_files() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);
        let batch = vec![
            entry(42, "combat.armor_class", ChangeCategory::Combat, "2026-02-07T12:00:00Z"),
            entry(42, "skills.arcana", ChangeCategory::Skills, "2026-02-08T12:00:00Z"),
        ];
        must(store.append(CharacterId(42), "Vex", &batch).await);

        let stats = must(store.statistics(CharacterId(42)).await);
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_files, 1);
        assert!(stats.total_size > 0);
        assert_eq!(stats.oldest, Some(batch[0].timestamp));
        assert_eq!(stats.newest, Some(batch[1].timestamp));
        assert_eq!(stats.category_counts.get("combat"), Some(&1));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn drift_is_repaired_and_corruption_is_reported() {
        let dir = temp_dir();
        let store = must(ChangeLogStore::open(config_in(&dir)).await);
        let batch = vec![entry(42, "skills.arcana", ChangeCategory::Skills, "2026-02-07T12:00:00Z")];
        let receipt = must(store.append(CharacterId(42), "Vex", &batch).await);

        let mut file = must_some(must(read_log_file(&receipt.path).await));
        file.metadata.total_entries = 9;
        let bytes = must(serde_json::to_vec_pretty(&file).map_err(anyhow::Error::from));
        must(write_atomic(&receipt.path, &bytes).await);

        let check = must(store.check_and_repair(&receipt.path).await);
        assert_eq!(check, FileCheck::Repaired { previous_total: 9, actual: 1 });
        assert_eq!(must(store.check_and_repair(&receipt.path).await), FileCheck::Valid);

        let broken = dir.join("Zed_9_changes.json");
        must(tokio::fs::write(&broken, b"{\"metadata\": ").await.map_err(anyhow::Error::from));
        assert!(matches!(
            must(store.check_and_repair(&broken).await),
            FileCheck::Corrupted(_)
        ));
        let untouched = must(tokio::fs::read(&broken).await.map_err(anyhow::Error::from));
        assert_eq!(untouched, b"{\"metadata\": ");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_character_are_serialized() {
        let dir = temp_dir();
        let store = Arc::new(must(ChangeLogStore::open(config_in(&dir)).await));

        let mut tasks = Vec::new();
        for index in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let batch = vec![entry(
                    42,
                    &format!("skills.skill_{index}"),
                    ChangeCategory::Skills,
                    "2026-02-07T12:00:00Z",
                )];
                store.append(CharacterId(42), "Vex", &batch).await
            }));
        }
        for task in tasks {
            must(must(task.await.map_err(anyhow::Error::from)));
        }

        let read = must(store.read(CharacterId(42), None, None).await);
        assert_eq!(read.len(), 16);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_round_trip_preserves_entries_across_rotation(
            minutes in prop::collection::vec(0u32..600, 1..24),
            rotation_kb in 1u32..6,
        ) {
            let runtime = must(tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(anyhow::Error::from));
            runtime.block_on(async {
                let dir = temp_dir();
                let mut config = config_in(&dir);
                config.rotation_size_mb = f64::from(rotation_kb) / 1024.0;
                let store = must(ChangeLogStore::open(config).await);

                let mut written = Vec::new();
                for (index, minute) in minutes.iter().enumerate() {
                    let at = format!("2026-02-07T{:02}:{:02}:00Z", minute / 60, minute % 60);
                    let item = entry(42, &format!("skills.skill_{index}"), ChangeCategory::Skills, &at);
                    must(store.append(CharacterId(42), "Vex", std::slice::from_ref(&item)).await);
                    written.push(item);
                }

                let read = must(store.read(CharacterId(42), None, None).await);
                assert_eq!(read.len(), written.len());
                assert!(read.windows(2).all(|pair| pair[0].timestamp >= pair[1].timestamp));
                for item in &written {
                    assert!(read.contains(item));
                }

                let _ = tokio::fs::remove_dir_all(&dir).await;
            });
        }
    }
}
