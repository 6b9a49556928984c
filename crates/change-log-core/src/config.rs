use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChangeLogError;

const MAX_RETENTION_DAYS: u32 = 3650;
const MAX_ROTATION_SIZE_MB: f64 = 1024.0;
const MAX_RETRIES: u32 = 10;

/// Backoff policy for retried storage operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub exponential_base: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            exponential_base: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (0-based):
    /// `min(base * exponential_base^attempt, max_delay)`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.max_retries > MAX_RETRIES {
            errors.push(format!("retry.max_retries MUST be <= {MAX_RETRIES}"));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            errors.push("retry.exponential_base MUST be a finite value >= 1.0".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            errors.push("retry.base_delay_ms MUST be <= retry.max_delay_ms".to_string());
        }
    }
}

/// Settings shared by the store, query, maintenance and service layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChangeLogConfig {
    pub storage_dir: PathBuf,
    pub retention_days: u32,
    pub rotation_size_mb: f64,
    pub backup_old_logs: bool,
    pub enable_causation_analysis: bool,
    pub enable_detailed_descriptions: bool,
    pub max_entries_per_batch: usize,
    pub retry: RetryConfig,
    pub error_journal_max_records: usize,
    pub alert_failure_threshold: u32,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./character_data/change_logs"),
            retention_days: 365,
            rotation_size_mb: 10.0,
            backup_old_logs: true,
            enable_causation_analysis: true,
            enable_detailed_descriptions: true,
            max_entries_per_batch: 1_000,
            retry: RetryConfig::default(),
            error_journal_max_records: 1_000,
            alert_failure_threshold: 5,
        }
    }
}

impl ChangeLogConfig {
    #[must_use]
    pub fn with_storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = storage_dir.into();
        self
    }

    /// Every constraint violation, in field order. Empty when valid.
    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.storage_dir.as_os_str().is_empty() {
            errors.push("storage_dir MUST be provided".to_string());
        }
        if self.retention_days == 0 || self.retention_days > MAX_RETENTION_DAYS {
            errors.push(format!(
                "retention_days MUST be in [1, {MAX_RETENTION_DAYS}]"
            ));
        }
        if !self.rotation_size_mb.is_finite()
            || self.rotation_size_mb <= 0.0
            || self.rotation_size_mb > MAX_ROTATION_SIZE_MB
        {
            errors.push(format!(
                "rotation_size_mb MUST be in (0, {MAX_ROTATION_SIZE_MB}]"
            ));
        }
        if self.max_entries_per_batch == 0 {
            errors.push("max_entries_per_batch MUST be >= 1".to_string());
        }
        if self.error_journal_max_records == 0 {
            errors.push("error_journal_max_records MUST be >= 1".to_string());
        }
        if self.alert_failure_threshold == 0 {
            errors.push("alert_failure_threshold MUST be >= 1".to_string());
        }
        self.retry.collect_errors(&mut errors);

        errors
    }

    /// Validates all settings.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Configuration`] listing every violated
    /// constraint. Values are never clamped.
    pub fn validate(&self) -> Result<(), ChangeLogError> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChangeLogError::Configuration(errors.join("; ")))
        }
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, ChangeLogError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ChangeLogError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file and validates it.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Configuration`] when the file cannot be read
    /// or fails [`ChangeLogConfig::from_json`].
    pub fn from_json_file(path: &Path) -> Result<Self, ChangeLogError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ChangeLogError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| {
            ChangeLogError::Configuration(format!("invalid JSON in {}: {err}", path.display()))
        })?;
        Self::from_json(&value)
    }

    /// Size at which the current log file is rotated.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn rotation_threshold_bytes(&self) -> u64 {
        (self.rotation_size_mb * 1024.0 * 1024.0).max(1.0) as u64
    }
}
