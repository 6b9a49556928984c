//! Failure journal, retry policy and component health for the change log
//! write path.
//!
//! One [`ErrorHandler`] is constructed per service and shared by reference;
//! there is no global instance.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use change_log_core::{days_before, now_utc, timestamp, CharacterId, RetryConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::atomic::write_json_atomic;

const MAX_MESSAGE_CHARS: usize = 500;
const ALERT_WINDOW: time::Duration = time::Duration::HOUR;
const JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DetectorFailure,
    StorageFailure,
    DataValidation,
    CausationAnalysis,
    Configuration,
    Network,
    System,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DetectorFailure => "detector_failure",
            Self::StorageFailure => "storage_failure",
            Self::DataValidation => "data_validation",
            Self::CausationAnalysis => "causation_analysis",
            Self::Configuration => "configuration",
            Self::Network => "network",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::DetectorFailure | Self::CausationAnalysis => ErrorSeverity::Low,
            Self::DataValidation | Self::Network => ErrorSeverity::Medium,
            Self::StorageFailure | Self::Configuration => ErrorSeverity::High,
            Self::System => ErrorSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub error_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub character_id: Option<CharacterId>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, with = "timestamp::option")]
    pub resolution_timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentHealth {
    pub component: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    #[serde(with = "timestamp::option")]
    pub last_failure: Option<OffsetDateTime>,
    #[serde(with = "timestamp::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(skip)]
    recent_failures: VecDeque<OffsetDateTime>,
    #[serde(skip)]
    last_alert: Option<OffsetDateTime>,
}

impl ComponentHealth {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            healthy: true,
            consecutive_failures: 0,
            total_failures: 0,
            last_failure: None,
            last_success: None,
            recent_failures: VecDeque::new(),
            last_alert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComponentAlert {
    pub component: String,
    pub recent_failures: usize,
    #[serde(with = "timestamp")]
    pub raised_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub unresolved_errors: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub components: Vec<ComponentHealth>,
    pub alerts_raised: usize,
}

#[derive(Debug, Default)]
struct HandlerState {
    records: VecDeque<ErrorRecord>,
    components: BTreeMap<String, ComponentHealth>,
    alerts: Vec<ComponentAlert>,
}

#[derive(Debug)]
pub struct ErrorHandler {
    retry: RetryConfig,
    max_records: usize,
    alert_threshold: u32,
    state: Mutex<HandlerState>,
}

impl ErrorHandler {
    #[must_use]
    pub fn new(retry: RetryConfig, max_records: usize, alert_threshold: u32) -> Self {
        Self {
            retry,
            max_records: max_records.max(1),
            alert_threshold: alert_threshold.max(1),
            state: Mutex::new(HandlerState::default()),
        }
    }

    #[must_use]
    pub fn from_config(config: &change_log_core::ChangeLogConfig) -> Self {
        Self::new(
            config.retry.clone(),
            config.error_journal_max_records,
            config.alert_failure_threshold,
        )
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A causation detector failed. Returns whether processing may
    /// continue, which is false only for process-fatal failures.
    pub fn handle_detector_error(
        &self,
        detector: &str,
        err: &anyhow::Error,
        character_id: Option<CharacterId>,
    ) -> bool {
        let fatal = is_fatal(err);
        let severity = if fatal {
            ErrorSeverity::Critical
        } else {
            ErrorCategory::DetectorFailure.default_severity()
        };
        let mut context = Map::new();
        context.insert("detector".to_string(), json!(detector));
        self.record(
            ErrorCategory::DetectorFailure,
            severity,
            &format!("detector.{detector}"),
            &format!("{err:#}"),
            context,
            character_id,
        );
        !fatal
    }

    /// Causation is enrichment only, so this always allows storage to
    /// proceed.
    pub fn handle_causation_analysis_error(
        &self,
        err: &anyhow::Error,
        character_id: Option<CharacterId>,
    ) -> bool {
        self.record(
            ErrorCategory::CausationAnalysis,
            ErrorCategory::CausationAnalysis.default_severity(),
            "causation_analyzer",
            &format!("{err:#}"),
            Map::new(),
            character_id,
        );
        true
    }

    /// Best-effort repair of a malformed snapshot. Returns the sanitized
    /// document, or `None` when nothing usable can be recovered.
    pub fn handle_data_validation_error(
        &self,
        source: &str,
        err: &str,
        malformed: &Value,
    ) -> Option<Value> {
        let sanitized = sanitize_snapshot(malformed);
        let mut context = Map::new();
        context.insert("source".to_string(), json!(source));
        context.insert("recovered".to_string(), json!(sanitized.is_some()));
        let id = self.record(
            ErrorCategory::DataValidation,
            ErrorCategory::DataValidation.default_severity(),
            &format!("validation.{source}"),
            err,
            context,
            None,
        );
        if sanitized.is_some() {
            self.resolve(&id);
        }
        sanitized
    }

    /// Retries `retry` with exponential backoff after `err`. Returns the
    /// first successful value and marks the originating record resolved.
    ///
    /// # Errors
    /// Returns the last failure once retries are exhausted.
    pub async fn handle_storage_error<T, F, Fut>(
        &self,
        operation: &str,
        err: anyhow::Error,
        character_id: Option<CharacterId>,
        retry: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.handle_storage_error_until(operation, err, character_id, None, retry)
            .await
    }

    /// [`Self::handle_storage_error`] bounded by a caller deadline: no backoff
    /// sleep is started that would end after `deadline`.
    ///
    /// # Errors
    /// Returns the last failure once retries are exhausted or the deadline
    /// would be passed.
    pub async fn handle_storage_error_until<T, F, Fut>(
        &self,
        operation: &str,
        err: anyhow::Error,
        character_id: Option<CharacterId>,
        deadline: Option<Instant>,
        mut retry: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let component = format!("storage.{operation}");
        let mut context = Map::new();
        context.insert("operation".to_string(), json!(operation));
        let record_id = self.record(
            ErrorCategory::StorageFailure,
            ErrorCategory::StorageFailure.default_severity(),
            &component,
            &format!("{err:#}"),
            context,
            character_id,
        );
        if is_fatal(&err) {
            return Err(err);
        }

        let mut last = err;
        for attempt in 0..self.retry.max_retries {
            let delay = self.backoff(attempt);
            if deadline.is_some_and(|deadline| Instant::now() + delay > deadline) {
                warn!(operation, attempt, "retry deadline reached; giving up");
                break;
            }
            tokio::time::sleep(delay).await;

            match retry().await {
                Ok(value) => {
                    info!(operation, attempt = attempt + 1, "storage operation recovered");
                    self.resolve(&record_id);
                    self.record_success(&component);
                    return Ok(value);
                }
                Err(next) => {
                    warn!(operation, attempt = attempt + 1, error = %next, "storage retry failed");
                    self.bump_retry(&record_id);
                    self.note_failure(&component);
                    last = next;
                }
            }
        }

        error!(operation, error = %last, "storage operation failed after retries");
        Err(last.context(format!("{operation} failed after retries")))
    }

    /// Backoff before retry `attempt`, with up to ±50% jitter when enabled.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.delay_for_attempt(attempt);
        if !self.retry.jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        base.mul_f64(1.0 + factor)
    }

    pub fn record_success(&self, component: &str) {
        let mut state = self.state();
        let health = state
            .components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(component));
        health.healthy = true;
        health.consecutive_failures = 0;
        health.last_success = Some(now_utc());
    }

    /// Journals a failure and returns its id.
    pub fn record(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        component: &str,
        message: &str,
        context: Map<String, Value>,
        character_id: Option<CharacterId>,
    ) -> String {
        let error_id = Ulid::new().to_string();
        let record = ErrorRecord {
            error_id: error_id.clone(),
            timestamp: now_utc(),
            category,
            severity,
            component: component.to_string(),
            message: sanitize_message(message),
            context,
            character_id,
            retry_count: 0,
            resolved: false,
            resolution_timestamp: None,
        };
        warn!(
            category = category.as_str(),
            severity = severity.as_str(),
            component,
            message = record.message.as_str(),
            "change log error recorded"
        );

        {
            let mut state = self.state();
            state.records.push_back(record);
            while state.records.len() > self.max_records {
                state.records.pop_front();
            }
        }
        self.note_failure(component);
        error_id
    }

    fn note_failure(&self, component: &str) {
        let now = now_utc();
        let mut state = self.state();
        let health = state
            .components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth::new(component));
        health.consecutive_failures += 1;
        health.total_failures += 1;
        health.last_failure = Some(now);
        health.recent_failures.push_back(now);
        while health
            .recent_failures
            .front()
            .is_some_and(|at| now - *at > ALERT_WINDOW)
        {
            health.recent_failures.pop_front();
        }
        health.healthy = health.consecutive_failures < self.alert_threshold;

        let recent = health.recent_failures.len();
        let threshold = usize::try_from(self.alert_threshold).unwrap_or(usize::MAX);
        let alert_due = match health.last_alert {
            Some(last) => now - last >= ALERT_WINDOW,
            None => true,
        };
        if recent >= threshold && alert_due {
            health.last_alert = Some(now);
            error!(
                component,
                recent_failures = recent,
                "component failure threshold crossed"
            );
            state.alerts.push(ComponentAlert {
                component: component.to_string(),
                recent_failures: recent,
                raised_at: now,
            });
        }
    }

    fn resolve(&self, error_id: &str) {
        let mut state = self.state();
        if let Some(record) = state
            .records
            .iter_mut()
            .find(|record| record.error_id == error_id)
        {
            record.resolved = true;
            record.resolution_timestamp = Some(now_utc());
        }
    }

    fn bump_retry(&self, error_id: &str) {
        let mut state = self.state();
        if let Some(record) = state
            .records
            .iter_mut()
            .find(|record| record.error_id == error_id)
        {
            record.retry_count += 1;
        }
    }

    #[must_use]
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.state().records.iter().cloned().collect()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<ComponentAlert> {
        self.state().alerts.clone()
    }

    #[must_use]
    pub fn component_health(&self, component: &str) -> Option<ComponentHealth> {
        self.state().components.get(component).cloned()
    }

    #[must_use]
    pub fn error_statistics(&self) -> ErrorStatistics {
        let state = self.state();
        let mut by_category = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for record in &state.records {
            *by_category
                .entry(record.category.as_str().to_string())
                .or_insert(0) += 1;
            *by_severity
                .entry(record.severity.as_str().to_string())
                .or_insert(0) += 1;
        }
        ErrorStatistics {
            total_errors: state.records.len(),
            unresolved_errors: state.records.iter().filter(|record| !record.resolved).count(),
            by_category,
            by_severity,
            components: state.components.values().cloned().collect(),
            alerts_raised: state.alerts.len(),
        }
    }

    /// Drops resolved records older than `days`. Unresolved records are kept
    /// regardless of age. Returns the number removed.
    pub fn cleanup_resolved_errors(&self, days: u32) -> usize {
        let Some(cutoff) = days_before(now_utc(), days) else {
            return 0;
        };
        let mut state = self.state();
        let before = state.records.len();
        state
            .records
            .retain(|record| !(record.resolved && record.timestamp < cutoff));
        before - state.records.len()
    }

    /// Writes the journal to `path` atomically.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    pub async fn save_journal(&self, path: &Path) -> Result<()> {
        let records = self.records();
        write_json_atomic(path, &json!({ "errors": records }))
            .await
            .with_context(|| format!("failed to save error journal to {}", path.display()))
    }
}

/// Out-of-memory conditions are not survivable; everything else is.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::OutOfMemory)
    })
}

fn sanitize_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        let mut truncated: String = trimmed.chars().take(MAX_MESSAGE_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        trimmed.to_string()
    }
}

/// Coerces well-known snapshot fields into safe values. Accepts objects and
/// strings holding a JSON object.
fn sanitize_snapshot(malformed: &Value) -> Option<Value> {
    let mut object = match malformed {
        Value::Object(object) => object.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => object,
            _ => return None,
        },
        _ => return None,
    };

    object.retain(|_, value| !value.is_null());
    for key in ["name", "character_name"] {
        if let Some(value) = object.get_mut(key) {
            if !value.is_string() {
                *value = json!(value.to_string());
            }
        }
    }
    if let Some(value) = object.get_mut("level") {
        *value = json!(coerce_int(value).filter(|level| *level >= 1).unwrap_or(1));
    }
    if let Some(value) = object.get_mut("classes") {
        if !(value.is_array() || value.is_object()) {
            *value = json!([]);
        }
    }
    for key in ["ability_scores", "abilities"] {
        if let Some(value) = object.get_mut(key) {
            let scores = value
                .as_object()
                .map(|scores| {
                    scores
                        .iter()
                        .filter_map(|(ability, score)| {
                            coerce_int(score).map(|score| (ability.clone(), json!(score.clamp(1, 30))))
                        })
                        .collect::<Map<String, Value>>()
                })
                .unwrap_or_default();
            *value = Value::Object(scores);
        }
    }
    Some(Value::Object(object))
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            #[allow(clippy::cast_possible_truncation)]
            number.as_f64().filter(|float| float.is_finite()).map(|float| float.round() as i64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn handler(max_retries: u32) -> ErrorHandler {
        ErrorHandler::new(
            RetryConfig {
                max_retries,
                base_delay_ms: 100,
                exponential_base: 2.0,
                max_delay_ms: 1_000,
                jitter: false,
            },
            50,
            3,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn storage_retry_resolves_the_record_on_success() {
        let handler = handler(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = handler
            .handle_storage_error(
                "append",
                anyhow::anyhow!("disk busy"),
                Some(CharacterId(1)),
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("still busy");
                        }
                        Ok(7)
                    }
                },
            )
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let records = handler.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].resolved);
        assert_eq!(records[0].retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_retry_gives_up_after_max_retries() {
        let handler = handler(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = handler
            .handle_storage_error("rotate", anyhow::anyhow!("nope"), None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("still nope") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!handler.records()[0].resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retries_before_sleeping_past_it() {
        let handler = handler(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let deadline = Instant::now() + Duration::from_millis(350);

        let result: Result<()> = handler
            .handle_storage_error_until(
                "append",
                anyhow::anyhow!("nope"),
                None,
                Some(deadline),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { anyhow::bail!("still nope") }
                },
            )
            .await;

        assert!(result.is_err());
        // Sleeps of 100ms and 200ms fit; the next 400ms sleep would not.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jitter_stays_within_half_of_the_base_delay() {
        let mut handler = handler(3);
        handler.retry.jitter = true;
        for _ in 0..100 {
            let delay = handler.backoff(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn fatal_detector_errors_stop_processing() {
        let handler = handler(0);
        let recoverable = anyhow::anyhow!("regex exploded");
        assert!(handler.handle_detector_error("feat", &recoverable, None));

        let fatal = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::OutOfMemory));
        assert!(!handler.handle_detector_error("feat", &fatal, None));

        let stats = handler.error_statistics();
        assert_eq!(stats.by_category.get("detector_failure"), Some(&2));
        assert_eq!(stats.by_severity.get("critical"), Some(&1));
    }

    #[test]
    fn alerts_fire_once_per_window_after_threshold() {
        let handler = handler(0);
        for _ in 0..10 {
            handler.handle_causation_analysis_error(&anyhow::anyhow!("boom"), None);
        }

        let alerts = handler.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].component, "causation_analyzer");
        assert_eq!(alerts[0].recent_failures, 3);

        let health = handler.component_health("causation_analyzer");
        assert!(health.is_some_and(|health| !health.healthy && health.consecutive_failures == 10));

        handler.record_success("causation_analyzer");
        let health = handler.component_health("causation_analyzer");
        assert!(health.is_some_and(|health| health.healthy && health.consecutive_failures == 0));
    }

    #[test]
    fn journal_is_capped_fifo() {
        let handler = ErrorHandler::new(RetryConfig::default(), 3, 100);
        for index in 0..5 {
            handler.record(
                ErrorCategory::Network,
                ErrorSeverity::Medium,
                "network",
                &format!("failure {index}"),
                Map::new(),
                None,
            );
        }
        let messages: Vec<String> = handler
            .records()
            .into_iter()
            .map(|record| record.message)
            .collect();
        assert_eq!(messages, vec!["failure 2", "failure 3", "failure 4"]);
    }

    #[test]
    fn snapshots_are_sanitized_when_possible() {
        let handler = handler(0);
        let malformed = json!({
            "name": 42,
            "level": "three",
            "classes": "fighter",
            "ability_scores": {"strength": "18", "dexterity": 99, "wisdom": "high"},
            "notes": null
        });

        let sanitized = handler.handle_data_validation_error("new_snapshot", "bad types", &malformed);
        assert_eq!(
            sanitized,
            Some(json!({
                "name": "42",
                "level": 1,
                "classes": [],
                "ability_scores": {"strength": 18, "dexterity": 30}
            }))
        );
        assert!(handler.records()[0].resolved);

        assert_eq!(
            handler.handle_data_validation_error("new_snapshot", "not an object", &json!([1, 2])),
            None
        );
        assert!(!handler.records()[1].resolved);
    }

    #[test]
    fn long_messages_are_truncated_and_control_characters_removed() {
        let message = format!("line1\nline2\t{}", "x".repeat(600));
        let cleaned = sanitize_message(&message);
        assert!(cleaned.starts_with("line1 line2 "));
        assert_eq!(cleaned.chars().count(), MAX_MESSAGE_CHARS + 3);
    }

    #[test]
    fn only_old_resolved_errors_are_cleaned_up() {
        let handler = handler(0);
        let resolved = handler.record(
            ErrorCategory::Network,
            ErrorSeverity::Low,
            "network",
            "old and resolved",
            Map::new(),
            None,
        );
        handler.record(
            ErrorCategory::Network,
            ErrorSeverity::Low,
            "network",
            "old and open",
            Map::new(),
            None,
        );
        handler.resolve(&resolved);
        {
            let mut state = handler.state();
            for record in &mut state.records {
                record.timestamp -= time::Duration::days(10);
            }
        }

        assert_eq!(handler.cleanup_resolved_errors(30), 0);
        assert_eq!(handler.cleanup_resolved_errors(u32::MAX), 0);
        assert_eq!(handler.cleanup_resolved_errors(7), 1);
        assert_eq!(handler.records().len(), 1);
        assert_eq!(handler.records()[0].message, "old and open");
    }
}
