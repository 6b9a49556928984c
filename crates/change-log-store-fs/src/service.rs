use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use change_log_core::{
    build_attribution, causation_for, detailed_description, now_utc, CausationAnalyzer,
    ChangeCausation, ChangeLogConfig, ChangeLogEntry, CharacterId, FieldChange,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::error_handler::ErrorHandler;
use crate::query::ChangeLogQuery;
use crate::store::{CharacterStatistics, ChangeLogStore};

/// Write-path facade: enriches a diff with causation and attribution and
/// stores it. Enrichment problems never block storage.
#[derive(Debug, Clone)]
pub struct ChangeLogService {
    store: Arc<ChangeLogStore>,
    query: ChangeLogQuery,
    analyzer: CausationAnalyzer,
    handler: Arc<ErrorHandler>,
}

impl ChangeLogService {
    /// Opens the store at `config.storage_dir` with the built-in causation
    /// rules.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or the storage
    /// directory cannot be created.
    pub async fn open(config: ChangeLogConfig) -> Result<Self> {
        let handler = Arc::new(ErrorHandler::from_config(&config));
        let store = Arc::new(ChangeLogStore::open(config).await?);
        Ok(Self::new(store, CausationAnalyzer::default(), handler))
    }

    #[must_use]
    pub fn new(
        store: Arc<ChangeLogStore>,
        analyzer: CausationAnalyzer,
        handler: Arc<ErrorHandler>,
    ) -> Self {
        let query = ChangeLogQuery::new(Arc::clone(&store));
        Self {
            store,
            query,
            analyzer,
            handler,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChangeLogStore> {
        &self.store
    }

    #[must_use]
    pub fn query(&self) -> &ChangeLogQuery {
        &self.query
    }

    #[must_use]
    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    fn config(&self) -> &ChangeLogConfig {
        self.store.config()
    }

    /// Logs one diff. Returns `true` once every entry is durably appended.
    /// Batches larger than `max_entries_per_batch` are split.
    pub async fn log_changes(
        &self,
        character_id: CharacterId,
        character_name: &str,
        changes: Vec<FieldChange>,
        old_snapshot: &Value,
        new_snapshot: &Value,
    ) -> bool {
        if changes.is_empty() {
            return true;
        }

        let causations = if self.config().enable_causation_analysis {
            self.analyze(character_id, &changes, old_snapshot, new_snapshot)
        } else {
            Vec::new()
        };

        let entries = self.build_entries(character_id, character_name, changes, &causations);
        let batch_size = self.config().max_entries_per_batch.max(1);
        for chunk in entries.chunks(batch_size) {
            if !self.append_with_retry(character_id, character_name, chunk).await {
                return false;
            }
        }

        info!(
            character_id = %character_id,
            entries = entries.len(),
            causations = causations.len(),
            "logged character changes"
        );
        true
    }

    /// Runs the analyzer on sanitized snapshots. Detectors are pure, so a
    /// failure only drops that detector's causations.
    fn analyze(
        &self,
        character_id: CharacterId,
        changes: &[FieldChange],
        old_snapshot: &Value,
        new_snapshot: &Value,
    ) -> Vec<ChangeCausation> {
        let (Some(old), Some(new)) = (
            self.usable_snapshot("old_snapshot", old_snapshot),
            self.usable_snapshot("new_snapshot", new_snapshot),
        ) else {
            self.handler.handle_causation_analysis_error(
                &anyhow!("snapshot could not be sanitized; storing changes without causation"),
                Some(character_id),
            );
            return Vec::new();
        };

        let report = self.analyzer.analyze_with_report(changes, &old, &new);
        for failure in &report.failures {
            self.handler.handle_detector_error(
                failure.detector.as_str(),
                &anyhow!("{}", failure.message),
                Some(character_id),
            );
        }
        report.causations
    }

    fn usable_snapshot<'a>(&self, source: &str, snapshot: &'a Value) -> Option<Cow<'a, Value>> {
        if snapshot.is_object() {
            return Some(Cow::Borrowed(snapshot));
        }
        self.handler
            .handle_data_validation_error(source, "snapshot is not a JSON object", snapshot)
            .map(Cow::Owned)
    }

    fn build_entries(
        &self,
        character_id: CharacterId,
        character_name: &str,
        changes: Vec<FieldChange>,
        causations: &[ChangeCausation],
    ) -> Vec<ChangeLogEntry> {
        let timestamp = now_utc();
        let detailed = self.config().enable_detailed_descriptions;
        changes
            .into_iter()
            .map(|change| {
                let causation = causation_for(&change.field_path, causations).cloned();
                let attribution = causation
                    .as_ref()
                    .map(|causation| build_attribution(&change, causation));
                let description = if detailed {
                    detailed_description(&change, causation.as_ref())
                } else {
                    change.summary()
                };

                let mut entry = ChangeLogEntry::new(change, character_id, character_name, timestamp);
                entry.detailed_description = description;
                entry.causation = causation;
                entry.attribution = attribution;
                entry
            })
            .collect()
    }

    async fn append_with_retry(
        &self,
        character_id: CharacterId,
        character_name: &str,
        chunk: &[ChangeLogEntry],
    ) -> bool {
        let first = self.store.append(character_id, character_name, chunk).await;
        let err = match first {
            Ok(receipt) => {
                debug!(character_id = %character_id, appended = receipt.appended, "append succeeded");
                self.handler.record_success("storage.append");
                return true;
            }
            Err(err) => err,
        };

        let retried = self
            .handler
            .handle_storage_error("append", err, Some(character_id), || {
                self.store.append(character_id, character_name, chunk)
            })
            .await;
        match retried {
            Ok(_) => true,
            Err(err) => {
                error!(character_id = %character_id, error = %err, "failed to store character changes");
                false
            }
        }
    }

    /// # Errors
    /// Returns an error when the character's files cannot be listed.
    pub async fn get_change_history(
        &self,
        character_id: CharacterId,
        since: Option<OffsetDateTime>,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        self.store.read(character_id, since, limit).await
    }

    /// # Errors
    /// Returns an error when the character's files cannot be listed.
    pub async fn get_change_statistics(&self, character_id: CharacterId) -> Result<CharacterStatistics> {
        self.store.statistics(character_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use change_log_core::{ChangeCategory, ChangeType, RetryConfig};
    use serde_json::json;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_config() -> ChangeLogConfig {
        let dir = std::env::temp_dir().join(format!("change-log-service-{}", Ulid::new()));
        ChangeLogConfig::default().with_storage_dir(dir)
    }

    fn change(path: &str, old: Value, new: Value, change_type: ChangeType) -> FieldChange {
        let category = if path.starts_with("combat") {
            ChangeCategory::Combat
        } else if path.starts_with("ability_scores") {
            ChangeCategory::Abilities
        } else {
            ChangeCategory::BasicInfo
        };
        FieldChange::new(path, old, new, change_type, category)
    }

    fn level_up() -> (Vec<FieldChange>, Value, Value) {
        (
            vec![
                change("classes.fighter.level", json!(4), json!(5), ChangeType::Incremented),
                change("combat.hit_points.maximum", json!(42), json!(50), ChangeType::Incremented),
            ],
            json!({"classes": [{"name": "Fighter", "level": 4}]}),
            json!({"classes": [{"name": "Fighter", "level": 5}]}),
        )
    }

    async fn open(config: ChangeLogConfig) -> (PathBuf, ChangeLogService) {
        let dir = config.storage_dir.clone();
        (dir, must(ChangeLogService::open(config).await))
    }

    #[tokio::test]
    async fn level_up_is_stored_with_causation_and_description() {
        let (dir, service) = open(temp_config()).await;
        let (changes, old, new) = level_up();

        assert!(service.log_changes(CharacterId(7), "Aria", changes, &old, &new).await);

        let history = must(service.get_change_history(CharacterId(7), None, None).await);
        assert_eq!(history.len(), 2);
        let hp = history
            .iter()
            .find(|entry| entry.field_path() == "combat.hit_points.maximum");
        let Some(hp) = hp else {
            panic!("hit point entry missing");
        };
        assert_eq!(hp.causation.as_ref().map(ChangeCausation::trigger_tag), Some("level_progression"));
        assert_eq!(
            hp.attribution.as_ref().map(|attribution| attribution.source_name.as_str()),
            Some("Fighter Level 5")
        );
        assert!(hp.detailed_description.contains("caused by Fighter Level 5"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn disabled_enrichment_stores_plain_entries() {
        let config = ChangeLogConfig {
            enable_causation_analysis: false,
            enable_detailed_descriptions: false,
            ..temp_config()
        };
        let (dir, service) = open(config).await;
        let (changes, old, new) = level_up();

        assert!(service.log_changes(CharacterId(7), "Aria", changes, &old, &new).await);
        let history = must(service.get_change_history(CharacterId(7), None, None).await);
        assert!(history.iter().all(|entry| entry.causation.is_none() && entry.attribution.is_none()));
        assert!(history
            .iter()
            .any(|entry| entry.detailed_description == "combat.hit_points.maximum changed from 42 to 50"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn malformed_snapshots_do_not_block_storage() {
        let (dir, service) = open(temp_config()).await;
        let (changes, _, new) = level_up();

        assert!(service.log_changes(CharacterId(7), "Aria", changes, &json!([1, 2]), &new).await);
        let stats = must(service.get_change_statistics(CharacterId(7)).await);
        assert_eq!(stats.total_entries, 2);

        let errors = service.error_handler().error_statistics();
        assert_eq!(errors.by_category.get("data_validation"), Some(&1));
        assert_eq!(errors.by_category.get("causation_analysis"), Some(&1));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn detector_failures_are_journaled_and_skipped() {
        let (dir, service) = open(temp_config()).await;
        let (mut changes, old, new) = level_up();
        changes.push(change(
            "ability_scores.dexterity",
            json!(14),
            json!("sixteen"),
            ChangeType::Modified,
        ));

        assert!(service.log_changes(CharacterId(7), "Aria", changes, &old, &new).await);
        let records = service.error_handler().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].component, "detector.ability_score");

        let stored = must(
            service
                .query()
                .get_changes_by_cause(CharacterId(7), "level_progression", None)
                .await,
        );
        // The level-up still links the dexterity change through its
        // ability score pattern even though that detector failed.
        assert_eq!(stored.len(), 3);
        assert!(stored
            .iter()
            .any(|entry| entry.field_path() == "ability_scores.dexterity"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn large_diffs_are_split_into_batches() {
        let config = ChangeLogConfig {
            max_entries_per_batch: 2,
            ..temp_config()
        };
        let (dir, service) = open(config).await;
        let changes: Vec<FieldChange> = (0..5)
            .map(|index| {
                change(
                    &format!("notes.{index}"),
                    Value::Null,
                    json!("text"),
                    ChangeType::Added,
                )
            })
            .collect();

        assert!(service.log_changes(CharacterId(8), "Bran", changes, &json!({}), &json!({})).await);
        let journal = must(service.store().health_journal().load().await);
        assert_eq!(journal.summary.total_operations, 3);
        assert_eq!(must(service.get_change_statistics(CharacterId(8)).await).total_entries, 5);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn exhausted_storage_retries_report_failure() {
        let config = ChangeLogConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                exponential_base: 1.0,
                max_delay_ms: 1,
                jitter: false,
            },
            ..temp_config()
        };
        let (dir, service) = open(config).await;
        must(tokio::fs::remove_dir_all(&dir).await.map_err(anyhow::Error::from));
        must(tokio::fs::write(&dir, b"not a directory").await.map_err(anyhow::Error::from));

        let (changes, old, new) = level_up();
        assert!(!service.log_changes(CharacterId(7), "Aria", changes, &old, &new).await);

        let errors = service.error_handler().error_statistics();
        assert_eq!(errors.by_category.get("storage_failure"), Some(&1));
        assert_eq!(errors.unresolved_errors, 1);
        assert_eq!(service.error_handler().records()[0].retry_count, 2);

        let _ = tokio::fs::remove_file(&dir).await;
    }
}
