//! Re-runnable maintenance sweeps composed from [`ChangeLogStore`] primitives.
//!
//! Every sweep returns a [`SweepResult`] instead of failing, so one broken
//! file or character never stops the rest of a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use change_log_core::{format_compact, now_utc, timestamp, ChangeLogFile};
use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::atomic::write_json_atomic;
use crate::error_handler::{ErrorCategory, ErrorHandler, ErrorStatistics};
use crate::journal::HealthSummary;
use crate::locator::{is_temp_file, list_dir, LogFileInfo, LogFileKind, ROTATED_DIR};
use crate::store::{CharacterStatistics, ChangeLogStore, FileCheck};

const GIB: u64 = 1024 * 1024 * 1024;
const INTEGRITY_SAMPLE_SIZE: usize = 10;
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Error => "error",
        }
    }
}

/// Free-space levels below which the disk check degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskThresholds {
    pub critical_bytes: u64,
    pub warning_bytes: u64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            critical_bytes: GIB,
            warning_bytes: 5 * GIB,
        }
    }
}

impl DiskThresholds {
    #[must_use]
    pub fn classify(&self, available: u64) -> HealthStatus {
        if available < self.critical_bytes {
            HealthStatus::Critical
        } else if available < self.warning_bytes {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl HealthCheck {
    fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details: Map::new(),
        }
    }

    fn detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageHealth {
    pub status: HealthStatus,
    #[serde(with = "timestamp")]
    pub checked_at: OffsetDateTime,
    pub storage_dir: PathBuf,
    pub checks: Vec<HealthCheck>,
    pub issues: Vec<String>,
}

/// Outcome of one maintenance operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepResult {
    pub operation: String,
    pub success: bool,
    pub processed: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl SweepResult {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            success: true,
            processed: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            details: Map::new(),
        }
    }

    fn failed(operation: &str, err: &anyhow::Error) -> Self {
        let mut result = Self::new(operation);
        result.success = false;
        result.errors.push(format!("{err:#}"));
        result
    }

    fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FileSummary {
    pub total_files: usize,
    pub total_size: u64,
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MaintenanceReport {
    #[serde(with = "timestamp")]
    pub generated_at: OffsetDateTime,
    pub storage_dir: PathBuf,
    pub health: StorageHealth,
    pub files: FileSummary,
    pub characters: Vec<CharacterStatistics>,
    pub journal: HealthSummary,
    pub errors: ErrorStatistics,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WrittenReport {
    pub path: PathBuf,
    pub report: MaintenanceReport,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MaintenanceRun {
    #[serde(with = "timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(with = "timestamp")]
    pub finished_at: OffsetDateTime,
    pub operations: Vec<SweepResult>,
    pub summary: MaintenanceSummary,
}

impl MaintenanceRun {
    #[must_use]
    pub fn success(&self) -> bool {
        self.summary.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceService {
    store: Arc<ChangeLogStore>,
    handler: Arc<ErrorHandler>,
    disk: DiskThresholds,
}

impl MaintenanceService {
    #[must_use]
    pub fn new(store: Arc<ChangeLogStore>) -> Self {
        let handler = Arc::new(ErrorHandler::from_config(store.config()));
        Self::with_error_handler(store, handler)
    }

    #[must_use]
    pub fn with_error_handler(store: Arc<ChangeLogStore>, handler: Arc<ErrorHandler>) -> Self {
        Self {
            store,
            handler,
            disk: DiskThresholds::default(),
        }
    }

    #[must_use]
    pub fn with_disk_thresholds(mut self, disk: DiskThresholds) -> Self {
        self.disk = disk;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChangeLogStore> {
        &self.store
    }

    #[must_use]
    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    /// Runs every health check. The overall status is the worst individual
    /// status.
    pub async fn check_storage_health(&self) -> StorageHealth {
        let storage_dir = self.store.locator().storage_dir().to_path_buf();
        let files = self.store.list_files().await;

        let mut checks = vec![
            check_directory_access(&storage_dir).await,
            self.check_disk_space(&storage_dir).await,
        ];
        match &files {
            Ok(files) => {
                checks.push(check_integrity(files).await);
                checks.push(self.check_rotation_need(files));
            }
            Err(err) => checks.push(HealthCheck::new(
                "file_listing",
                HealthStatus::Error,
                format!("failed to list change logs: {err:#}"),
            )),
        }
        checks.push(self.check_configuration());

        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let issues = checks
            .iter()
            .filter(|check| check.status != HealthStatus::Healthy)
            .map(|check| format!("{}: {}", check.name, check.message))
            .collect();

        debug!(status = status.as_str(), "storage health checked");
        StorageHealth {
            status,
            checked_at: now_utc(),
            storage_dir,
            checks,
            issues,
        }
    }

    async fn check_disk_space(&self, storage_dir: &Path) -> HealthCheck {
        const NAME: &str = "disk_space";
        let dir = storage_dir.to_path_buf();
        let available = tokio::task::spawn_blocking(move || fs2::available_space(dir)).await;
        match available {
            Ok(Ok(bytes)) => {
                let status = self.disk.classify(bytes);
                #[allow(clippy::cast_precision_loss)]
                let gib = bytes as f64 / GIB as f64;
                HealthCheck::new(NAME, status, format!("{gib:.2} GiB available"))
                    .detail("available_bytes", json!(bytes))
            }
            Ok(Err(err)) => HealthCheck::new(
                NAME,
                HealthStatus::Warning,
                format!("could not determine free space: {err}"),
            ),
            Err(err) => HealthCheck::new(
                NAME,
                HealthStatus::Warning,
                format!("free space probe did not complete: {err}"),
            ),
        }
    }

    fn check_rotation_need(&self, files: &[LogFileInfo]) -> HealthCheck {
        let threshold = self.store.config().rotation_threshold_bytes();
        let oversized = files
            .iter()
            .filter(|info| info.kind != LogFileKind::Rotated && info.size >= threshold)
            .count();
        let status = if oversized == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };
        HealthCheck::new(
            "rotation_needed",
            status,
            format!("{oversized} log file(s) at or above the rotation threshold"),
        )
        .detail("oversized_files", json!(oversized))
    }

    fn check_configuration(&self) -> HealthCheck {
        let problems = self.store.config().validation_errors();
        if problems.is_empty() {
            HealthCheck::new("configuration", HealthStatus::Healthy, "configuration is valid")
        } else {
            HealthCheck::new("configuration", HealthStatus::Error, problems.join("; "))
        }
    }

    /// Rotates every character whose current file is at or above the
    /// threshold.
    pub async fn rotate_oversized_logs(&self) -> SweepResult {
        const OPERATION: &str = "rotate_oversized_logs";
        let characters = match self.store.characters().await {
            Ok(characters) => characters,
            Err(err) => return SweepResult::failed(OPERATION, &err),
        };

        let mut result = SweepResult::new(OPERATION);
        let mut rotated = Vec::new();
        for character_id in characters {
            match self.store.rotate(character_id).await {
                Ok(outcome) => {
                    if outcome.rotated {
                        result.processed += 1;
                        rotated.push(json!(character_id));
                    }
                }
                Err(err) => {
                    warn!(character_id = %character_id, error = %err, "rotation sweep failed for character");
                    result.errors.push(format!("character {character_id}: {err:#}"));
                }
            }
        }
        result.details.insert("rotated_characters".to_string(), Value::Array(rotated));
        result.finish()
    }

    /// Applies the configured retention policy.
    pub async fn cleanup_expired_logs(&self) -> SweepResult {
        let retention_days = self.store.config().retention_days;
        let report = self.store.cleanup(retention_days).await;

        let mut result = SweepResult::new("cleanup_expired_logs");
        result.processed = report.processed;
        result.errors = report.errors;
        result.details.insert("retention_days".to_string(), json!(retention_days));
        result.details.insert("archived".to_string(), json!(report.archived));
        result.details.insert("deleted".to_string(), json!(report.deleted));
        result.finish()
    }

    /// Checks every log file. Counter drift is repaired in place and
    /// reported as a warning; undecodable files are errors and left as is.
    pub async fn validate_all_logs(&self) -> SweepResult {
        const OPERATION: &str = "validate_all_logs";
        let files = match self.store.list_files().await {
            Ok(files) => files,
            Err(err) => return SweepResult::failed(OPERATION, &err),
        };

        let mut result = SweepResult::new(OPERATION);
        let mut valid = 0;
        let mut repaired = Vec::new();
        let mut corrupted = Vec::new();
        for info in files {
            result.processed += 1;
            let shown = info.path.display().to_string();
            match self.store.check_and_repair(&info.path).await {
                Ok(FileCheck::Valid) => valid += 1,
                Ok(FileCheck::Repaired {
                    previous_total,
                    actual,
                }) => {
                    result.warnings.push(format!(
                        "{shown}: total_entries {previous_total} repaired to {actual}"
                    ));
                    repaired.push(json!(shown));
                }
                Ok(FileCheck::Corrupted(reason)) => {
                    warn!(path = %shown, reason = %reason, "corrupted change log needs manual inspection");
                    result.errors.push(format!("{shown}: corrupted: {reason}"));
                    corrupted.push(json!(shown));
                }
                Err(err) => result.errors.push(format!("{shown}: {err:#}")),
            }
        }

        result.details.insert("valid".to_string(), json!(valid));
        result.details.insert("repaired".to_string(), Value::Array(repaired));
        result.details.insert("corrupted".to_string(), Value::Array(corrupted));
        result.finish()
    }

    /// Normalizes the directory layout and reaps stale temp files.
    pub async fn optimize_storage(&self) -> SweepResult {
        self.optimize_storage_as_of(SystemTime::now()).await
    }

    /// [`Self::optimize_storage`] against an explicit clock. Temp files
    /// younger than an hour may belong to an in-flight write and are kept.
    pub async fn optimize_storage_as_of(&self, now: SystemTime) -> SweepResult {
        let locator = self.store.locator();
        let mut result = SweepResult::new("optimize_storage");

        for dir in [locator.archive_dir(), locator.reports_dir()] {
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                result
                    .errors
                    .push(format!("failed to create {}: {err}", dir.display()));
            }
        }

        let mut reaped = 0;
        match walk_files(locator.storage_dir()).await {
            Ok(files) => {
                for path in files.into_iter().filter(|path| is_temp_file(path)) {
                    let modified = tokio::fs::metadata(&path)
                        .await
                        .ok()
                        .and_then(|metadata| metadata.modified().ok());
                    let stale = modified
                        .and_then(|modified| now.duration_since(modified).ok())
                        .is_some_and(|age| age >= STALE_TEMP_AGE);
                    if !stale {
                        continue;
                    }
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            debug!(path = %path.display(), "removed stale temp file");
                            reaped += 1;
                        }
                        Err(err) => result
                            .errors
                            .push(format!("failed to remove {}: {err}", path.display())),
                    }
                }
            }
            Err(err) => result.errors.push(format!("{err:#}")),
        }

        let removed_dirs = match remove_empty_character_dirs(locator.storage_dir()).await {
            Ok(count) => count,
            Err(err) => {
                result.errors.push(format!("{err:#}"));
                0
            }
        };

        result.processed = reaped + removed_dirs;
        result.details.insert("temp_files_removed".to_string(), json!(reaped));
        result
            .details
            .insert("empty_directories_removed".to_string(), json!(removed_dirs));
        result.details.insert("consolidation".to_string(), json!("skipped"));
        result.details.insert("permissions".to_string(), json!("unchanged"));
        result.finish()
    }

    /// Snapshots health, file inventory, per-character statistics and both
    /// journals into a JSON artifact. Defaults to
    /// `maintenance_reports/maintenance_report_<stamp>.json`.
    ///
    /// # Errors
    /// Returns an error when the inventory cannot be listed or the report
    /// cannot be written.
    pub async fn generate_maintenance_report(&self, output: Option<&Path>) -> Result<WrittenReport> {
        let generated_at = now_utc();
        let health = self.check_storage_health().await;
        let files = self.store.list_files().await?;

        let mut summary = FileSummary::default();
        for info in &files {
            summary.total_files += 1;
            summary.total_size += info.size;
            let kind = match info.kind {
                LogFileKind::Current => "current",
                LogFileKind::Legacy => "legacy",
                LogFileKind::Rotated => "rotated",
            };
            *summary.by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }

        let mut characters = Vec::new();
        for character_id in self.store.characters().await? {
            match self.store.statistics(character_id).await {
                Ok(stats) => characters.push(stats),
                Err(err) => {
                    warn!(character_id = %character_id, error = %err, "skipping statistics in report");
                }
            }
        }
        let journal = self.store.health_journal().load().await?.summary;

        let report = MaintenanceReport {
            generated_at,
            storage_dir: self.store.locator().storage_dir().to_path_buf(),
            health,
            files: summary,
            characters,
            journal,
            errors: self.handler.error_statistics(),
        };

        let path = match output {
            Some(path) => path.to_path_buf(),
            None => self
                .store
                .locator()
                .reports_dir()
                .join(format!("maintenance_report_{}.json", format_compact(generated_at)?)),
        };
        write_json_atomic(&path, &report)
            .await
            .with_context(|| format!("failed to write maintenance report {}", path.display()))?;
        info!(path = %path.display(), "maintenance report written");
        Ok(WrittenReport { path, report })
    }

    /// Health, validate, rotate, cleanup, optimize, report. Each step runs
    /// even when an earlier one failed.
    pub async fn run_scheduled_maintenance(&self) -> MaintenanceRun {
        let started_at = now_utc();
        let mut operations = Vec::new();

        let health = self.check_storage_health().await;
        let mut health_result = SweepResult::new("check_storage_health");
        health_result.processed = health.checks.len();
        health_result
            .details
            .insert("status".to_string(), json!(health.status.as_str()));
        match health.status {
            HealthStatus::Healthy => {}
            HealthStatus::Warning => health_result.warnings.extend(health.issues),
            HealthStatus::Critical | HealthStatus::Error => health_result.errors.extend(health.issues),
        }
        operations.push(health_result.finish());

        operations.push(self.validate_all_logs().await);
        operations.push(self.rotate_oversized_logs().await);
        operations.push(self.cleanup_expired_logs().await);
        operations.push(self.optimize_storage().await);
        operations.push(match self.generate_maintenance_report(None).await {
            Ok(written) => {
                let mut result = SweepResult::new("generate_maintenance_report");
                result.processed = 1;
                result.details.insert(
                    "path".to_string(),
                    json!(written.path.display().to_string()),
                );
                result
            }
            Err(err) => SweepResult::failed("generate_maintenance_report", &err),
        });

        let mut summary = MaintenanceSummary {
            total: operations.len(),
            ..MaintenanceSummary::default()
        };
        for operation in &operations {
            let component = format!("maintenance.{}", operation.operation);
            if operation.success {
                summary.successful += 1;
                self.handler.record_success(&component);
            } else {
                summary.failed += 1;
                self.handler.record(
                    ErrorCategory::System,
                    ErrorCategory::System.default_severity(),
                    &component,
                    &operation.errors.join("; "),
                    Map::new(),
                    None,
                );
            }
            summary.warnings += operation.warnings.len();
        }

        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            warnings = summary.warnings,
            "scheduled maintenance finished"
        );
        MaintenanceRun {
            started_at,
            finished_at: now_utc(),
            operations,
            summary,
        }
    }
}

async fn check_directory_access(storage_dir: &Path) -> HealthCheck {
    const NAME: &str = "directory_access";
    match tokio::fs::metadata(storage_dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return HealthCheck::new(NAME, HealthStatus::Error, "storage path is not a directory"),
        Err(err) => {
            return HealthCheck::new(
                NAME,
                HealthStatus::Error,
                format!("storage directory is not accessible: {err}"),
            )
        }
    }

    let probe = storage_dir.join(format!(".write_probe_{}", Ulid::new()));
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            HealthCheck::new(NAME, HealthStatus::Healthy, "storage directory is writable")
        }
        Err(err) => HealthCheck::new(
            NAME,
            HealthStatus::Error,
            format!("storage directory is not writable: {err}"),
        ),
    }
}

/// Decodes up to a fixed sample of log files.
async fn check_integrity(files: &[LogFileInfo]) -> HealthCheck {
    let mut sampled = 0;
    let mut corrupted = Vec::new();
    for info in files.iter().take(INTEGRITY_SAMPLE_SIZE) {
        sampled += 1;
        let decoded = match tokio::fs::read(&info.path).await {
            Ok(bytes) => ChangeLogFile::decode(&bytes).map(|_| ()).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(reason) = decoded {
            corrupted.push(format!("{}: {reason}", info.path.display()));
        }
    }

    let status = if corrupted.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Warning
    };
    HealthCheck::new(
        "file_integrity",
        status,
        format!("{} of {sampled} sampled file(s) unreadable", corrupted.len()),
    )
    .detail("corrupted", json!(corrupted))
}

async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = pending.pop() {
        for path in list_dir(&dir).await? {
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Removes empty `rotated/` directories and then empty character
/// directories directly under the storage root.
async fn remove_empty_character_dirs(storage_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for dir in list_dir(storage_dir).await? {
        if !dir.is_dir() || !dir.join(ROTATED_DIR).is_dir() {
            continue;
        }
        let rotated = dir.join(ROTATED_DIR);
        if list_dir(&rotated).await?.is_empty() {
            tokio::fs::remove_dir(&rotated)
                .await
                .with_context(|| format!("failed to remove {}", rotated.display()))?;
            removed += 1;
        }
        if list_dir(&dir).await?.is_empty() {
            tokio::fs::remove_dir(&dir)
                .await
                .with_context(|| format!("failed to remove {}", dir.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
