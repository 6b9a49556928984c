use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use change_log_core::{
    days_before, hours_before, now_utc, timestamp, ChangeCategory, ChangeLogEntry, ChangePriority,
    ChangeType, CharacterId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::store::ChangeLogStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl FilterOperator {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanOrEqual => "greater_than_or_equal",
            Self::LessThan => "less_than",
            Self::LessThanOrEqual => "less_than_or_equal",
        }
    }
}

/// A generic `(field, operator, value)` predicate over an entry's JSON form.
/// `field` is a dotted path such as `causation.trigger`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl QueryFilter {
    #[must_use]
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Missing or null fields never match, whatever the operator.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        let Some(actual) = lookup(document, &self.field).filter(|value| !value.is_null()) else {
            return false;
        };
        match self.operator {
            FilterOperator::Equals => values_equal(actual, &self.value),
            FilterOperator::NotEquals => !values_equal(actual, &self.value),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(text), Value::String(needle)) => text.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
                _ => false,
            },
            FilterOperator::StartsWith => match (actual, &self.value) {
                (Value::String(text), Value::String(prefix)) => text.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOperator::EndsWith => match (actual, &self.value) {
                (Value::String(text), Value::String(suffix)) => text.ends_with(suffix.as_str()),
                _ => false,
            },
            FilterOperator::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|option| values_equal(actual, option))),
            FilterOperator::NotIn => self
                .value
                .as_array()
                .is_some_and(|options| !options.iter().any(|option| values_equal(actual, option))),
            FilterOperator::GreaterThan => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::LessThan => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::LessThanOrEqual => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

fn lookup<'v>(document: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(left), Some(right)) => (left - right).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    FieldPath,
    Category,
    Priority,
    ChangeType,
}

impl SortField {
    /// Unrecognised keys sort by timestamp.
    #[must_use]
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "field_path" => Self::FieldPath,
            "category" => Self::Category,
            "priority" => Self::Priority,
            "change_type" => Self::ChangeType,
            _ => Self::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryOptions {
    #[serde(with = "timestamp::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "timestamp::option")]
    pub end_date: Option<OffsetDateTime>,
    pub categories: BTreeSet<ChangeCategory>,
    pub priorities: BTreeSet<ChangePriority>,
    pub change_types: BTreeSet<ChangeType>,
    pub causation_triggers: BTreeSet<String>,
    pub attribution_sources: BTreeSet<String>,
    pub attribution_types: BTreeSet<String>,
    pub custom_filters: Vec<QueryFilter>,
    pub sort_by: SortField,
    pub sort_direction: SortDirection,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QueryOptions {
    /// Every filter kind is a conjunct; empty sets do not constrain.
    #[must_use]
    pub fn matches(&self, entry: &ChangeLogEntry, document: &Value) -> bool {
        if self.start_date.is_some_and(|start| entry.timestamp < start)
            || self.end_date.is_some_and(|end| entry.timestamp > end)
        {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&entry.change.category) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&entry.change.priority) {
            return false;
        }
        if !self.change_types.is_empty() && !self.change_types.contains(&entry.change.change_type)
        {
            return false;
        }
        if !self.causation_triggers.is_empty()
            && !entry
                .causation
                .as_ref()
                .is_some_and(|causation| self.causation_triggers.contains(causation.trigger_tag()))
        {
            return false;
        }
        if !self.attribution_sources.is_empty()
            && !entry
                .attribution
                .as_ref()
                .is_some_and(|attribution| self.attribution_sources.contains(&attribution.source))
        {
            return false;
        }
        if !self.attribution_types.is_empty()
            && !entry.attribution.as_ref().is_some_and(|attribution| {
                self.attribution_types.contains(&attribution.source_type)
            })
        {
            return false;
        }
        self.custom_filters
            .iter()
            .all(|filter| filter.matches(document))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    pub entries: Vec<ChangeLogEntry>,
    pub total_count: usize,
    pub filtered_count: usize,
    pub has_more: bool,
    #[serde(with = "duration_ms")]
    pub query_time: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1_000.0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CauseCount {
    pub source: String,
    pub source_name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CascadeAnalysis {
    pub primary_changes: usize,
    pub cascade_changes: usize,
    pub max_cascade_depth: u32,
    pub average_related_changes: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CausationReport {
    pub character_id: CharacterId,
    pub days_back: Option<u32>,
    #[serde(with = "timestamp")]
    pub generated_at: OffsetDateTime,
    pub total_changes: usize,
    pub changes_with_causation: usize,
    pub causation_breakdown: BTreeMap<String, usize>,
    pub attribution_breakdown: BTreeMap<String, usize>,
    pub top_causes: Vec<CauseCount>,
    pub cascade_analysis: CascadeAnalysis,
}

/// Entry predicates for [`ChangeLogQuery::cleanup_logs_by_criteria`]. An
/// entry is removed when it matches any populated criterion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupCriteria {
    pub max_age_days: Option<u32>,
    pub exclude_categories: BTreeSet<ChangeCategory>,
    pub min_priority: Option<ChangePriority>,
    pub exclude_change_types: BTreeSet<ChangeType>,
}

impl CleanupCriteria {
    fn removes(&self, entry: &ChangeLogEntry, now: OffsetDateTime) -> bool {
        let too_old = self
            .max_age_days
            .and_then(|days| days_before(now, days))
            .is_some_and(|cutoff| entry.timestamp < cutoff);
        too_old
            || self.exclude_categories.contains(&entry.change.category)
            || self
                .min_priority
                .is_some_and(|min| entry.change.priority < min)
            || self.exclude_change_types.contains(&entry.change.change_type)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CriteriaCleanupReport {
    pub character_id: CharacterId,
    pub removed: usize,
    pub remaining: usize,
}

const TOP_CAUSES_LIMIT: usize = 10;
const DEFAULT_SEARCH_FIELDS: [&str; 3] = ["field_path", "description", "detailed_description"];

/// Read-side access to change logs. Reads never take the character lock.
#[derive(Debug, Clone)]
pub struct ChangeLogQuery {
    store: Arc<ChangeLogStore>,
}

impl ChangeLogQuery {
    #[must_use]
    pub fn new(store: Arc<ChangeLogStore>) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns an error when the character's files cannot be listed.
    pub async fn query(&self, character_id: CharacterId, options: &QueryOptions) -> Result<QueryResult> {
        let started = Instant::now();
        let all = self.store.read(character_id, None, None).await?;
        let total_count = all.len();

        let mut filtered = Vec::new();
        for entry in all {
            let document = serde_json::to_value(&entry).context("failed to encode entry for filtering")?;
            if options.matches(&entry, &document) {
                filtered.push(entry);
            }
        }
        sort_entries(&mut filtered, options.sort_by, options.sort_direction);

        let filtered_count = filtered.len();
        let entries: Vec<ChangeLogEntry> = filtered
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        let has_more = options.offset + entries.len() < filtered_count;

        let query_time = started.elapsed();
        debug!(
            character_id = %character_id,
            total_count,
            filtered_count,
            returned = entries.len(),
            "change log query finished"
        );
        Ok(QueryResult {
            entries,
            total_count,
            filtered_count,
            has_more,
            query_time,
        })
    }

    /// Case-insensitive substring search, OR-ed across `fields` (defaults to
    /// field path and both descriptions).
    ///
    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn search(
        &self,
        character_id: CharacterId,
        text: &str,
        fields: &[&str],
        limit: Option<usize>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let fields: Vec<&str> = if fields.is_empty() {
            DEFAULT_SEARCH_FIELDS.to_vec()
        } else {
            fields.to_vec()
        };
        let needle = text.to_lowercase();

        let mut found = Vec::new();
        for entry in self.store.read(character_id, None, None).await? {
            let document = serde_json::to_value(&entry).context("failed to encode entry for search")?;
            let hit = fields.iter().any(|field| {
                lookup(&document, field).is_some_and(|value| match value {
                    Value::String(text) => text.to_lowercase().contains(&needle),
                    Value::Null => false,
                    other => other.to_string().to_lowercase().contains(&needle),
                })
            });
            if hit {
                found.push(entry);
            }
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    /// Entries whose causation has `trigger` and, when `name` is given, whose
    /// attribution source name or trigger details mention it.
    ///
    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn get_changes_by_cause(
        &self,
        character_id: CharacterId,
        trigger: &str,
        name: Option<&str>,
    ) -> Result<Vec<ChangeLogEntry>> {
        let name = name.map(str::to_lowercase);
        let entries = self.store.read(character_id, None, None).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let Some(causation) = &entry.causation else {
                    return false;
                };
                if causation.trigger_tag() != trigger {
                    return false;
                }
                let Some(name) = &name else {
                    return true;
                };
                let in_attribution = entry.attribution.as_ref().is_some_and(|attribution| {
                    attribution.source_name.to_lowercase().contains(name.as_str())
                });
                let in_details = serde_json::to_value(causation)
                    .ok()
                    .and_then(|value| value.get("trigger_details").cloned())
                    .is_some_and(|details| details.to_string().to_lowercase().contains(name.as_str()));
                in_attribution || in_details
            })
            .collect())
    }

    /// Entries causally related to any entry at `field_path` within
    /// `window_hours` of it. The anchor entries themselves are excluded.
    ///
    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn get_related_changes(
        &self,
        character_id: CharacterId,
        field_path: &str,
        window_hours: u32,
    ) -> Result<Vec<ChangeLogEntry>> {
        let window = time::Duration::hours(i64::from(window_hours));
        let entries = self.store.read(character_id, None, None).await?;
        let (anchors, others): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.field_path() == field_path);

        Ok(others
            .into_iter()
            .filter(|candidate| {
                anchors.iter().any(|anchor| {
                    (candidate.timestamp - anchor.timestamp).abs() <= window
                        && are_related(anchor, candidate)
                })
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn get_field_history(
        &self,
        character_id: CharacterId,
        field_path: &str,
    ) -> Result<Vec<ChangeLogEntry>> {
        let mut entries = self.store.read(character_id, None, None).await?;
        entries.retain(|entry| entry.field_path() == field_path);
        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn get_recent_changes(
        &self,
        character_id: CharacterId,
        hours: u32,
    ) -> Result<Vec<ChangeLogEntry>> {
        let since = hours_before(now_utc(), hours);
        self.store.read(character_id, since, None).await
    }

    /// # Errors
    /// Returns an error when the character's files cannot be read.
    pub async fn generate_causation_report(
        &self,
        character_id: CharacterId,
        days_back: Option<u32>,
    ) -> Result<CausationReport> {
        let generated_at = now_utc();
        let since = days_back.and_then(|days| days_before(generated_at, days));
        let entries = self.store.read(character_id, since, None).await?;

        let mut causation_breakdown = BTreeMap::new();
        let mut attribution_breakdown = BTreeMap::new();
        let mut causes: BTreeMap<(String, String), usize> = BTreeMap::new();
        let mut changes_with_causation = 0;
        let mut primary_changes = 0;
        let mut cascade_changes = 0;
        let mut max_cascade_depth = 0;
        let mut related_total = 0;

        for entry in &entries {
            if let Some(causation) = &entry.causation {
                changes_with_causation += 1;
                *causation_breakdown
                    .entry(causation.trigger_tag().to_string())
                    .or_insert(0) += 1;
                if causation.cascade_depth == 0 {
                    primary_changes += 1;
                } else {
                    cascade_changes += 1;
                }
                max_cascade_depth = max_cascade_depth.max(causation.cascade_depth);
                related_total += causation.related_changes.len();
            }
            if let Some(attribution) = &entry.attribution {
                *attribution_breakdown
                    .entry(attribution.source_type.clone())
                    .or_insert(0) += 1;
                *causes
                    .entry((attribution.source.clone(), attribution.source_name.clone()))
                    .or_insert(0) += 1;
            }
        }

        let mut top_causes: Vec<CauseCount> = causes
            .into_iter()
            .map(|((source, source_name), count)| CauseCount {
                source,
                source_name,
                count,
            })
            .collect();
        top_causes.sort_by(|left, right| right.count.cmp(&left.count));
        top_causes.truncate(TOP_CAUSES_LIMIT);

        #[allow(clippy::cast_precision_loss)]
        let average_related_changes = if changes_with_causation == 0 {
            0.0
        } else {
            related_total as f64 / changes_with_causation as f64
        };

        Ok(CausationReport {
            character_id,
            days_back,
            generated_at,
            total_changes: entries.len(),
            changes_with_causation,
            causation_breakdown,
            attribution_breakdown,
            top_causes,
            cascade_analysis: CascadeAnalysis {
                primary_changes,
                cascade_changes,
                max_cascade_depth,
                average_related_changes,
            },
        })
    }

    /// Destructively removes matching entries from the character's current
    /// file and saves it atomically. Rotated files are not touched.
    ///
    /// # Errors
    /// Returns an error when the current file is corrupted or cannot be
    /// rewritten.
    pub async fn cleanup_logs_by_criteria(
        &self,
        character_id: CharacterId,
        criteria: &CleanupCriteria,
    ) -> Result<CriteriaCleanupReport> {
        let now = now_utc();
        let outcome = self
            .store
            .rewrite_current(character_id, |file| {
                let before = file.entries.len();
                file.entries.retain(|entry| !criteria.removes(entry, now));
                (before - file.entries.len(), file.entries.len())
            })
            .await?;
        let (removed, remaining) = outcome.unwrap_or((0, 0));

        info!(
            character_id = %character_id,
            removed,
            remaining,
            "cleaned change log entries by criteria"
        );
        Ok(CriteriaCleanupReport {
            character_id,
            removed,
            remaining,
        })
    }
}

/// Symmetric: shared trigger, one listing the other's path, or the same
/// attribution source and name.
fn are_related(left: &ChangeLogEntry, right: &ChangeLogEntry) -> bool {
    if let (Some(a), Some(b)) = (&left.causation, &right.causation) {
        if a.trigger == b.trigger {
            return true;
        }
    }
    let lists = |entry: &ChangeLogEntry, path: &str| {
        entry
            .causation
            .as_ref()
            .is_some_and(|causation| causation.explains(path))
    };
    if lists(left, right.field_path()) || lists(right, left.field_path()) {
        return true;
    }
    match (&left.attribution, &right.attribution) {
        (Some(a), Some(b)) => a.source == b.source && a.source_name == b.source_name,
        _ => false,
    }
}

fn sort_entries(entries: &mut [ChangeLogEntry], field: SortField, direction: SortDirection) {
    entries.sort_by(|left, right| {
        let ordering = match field {
            SortField::Timestamp => left.timestamp.cmp(&right.timestamp),
            SortField::FieldPath => left.field_path().cmp(right.field_path()),
            SortField::Category => left.change.category.as_str().cmp(right.change.category.as_str()),
            SortField::Priority => left.change.priority.cmp(&right.change.priority),
            SortField::ChangeType => left
                .change
                .change_type
                .as_str()
                .cmp(right.change.change_type.as_str()),
        }
        .then_with(|| left.timestamp.cmp(&right.timestamp));
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}
