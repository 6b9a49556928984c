//! Data model and pure analysis logic for character change logs.
//!
//! This crate is synchronous; its only I/O is reading a configuration file in
//! [`ChangeLogConfig::from_json_file`]. Storage, querying and
//! maintenance live in `change-log-store-fs`; the maintenance CLI lives in
//! `change-log-cli`.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub mod attribution;
pub mod causation;
mod config;

pub use attribution::{build_attribution, detailed_description, unknown_attribution};
pub use causation::{
    causation_for, AnalysisReport, CausationAnalyzer, CausationRules, DetectorFailure,
    RulePattern, SpecificRule, TriggerKind, TriggerRules,
};
pub use config::{ChangeLogConfig, RetryConfig};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChangeLogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CharacterId(pub u64);

impl Display for CharacterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Incremented,
    Decremented,
    Removed,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Incremented => "incremented",
            Self::Decremented => "decremented",
            Self::Removed => "removed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "added" => Some(Self::Added),
            "modified" => Some(Self::Modified),
            "incremented" => Some(Self::Incremented),
            "decremented" => Some(Self::Decremented),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Category of a changed field. Names outside the built-in set are kept
/// verbatim in [`ChangeCategory::Custom`] so rewrites never relabel them.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ChangeCategory {
    BasicInfo,
    Abilities,
    Skills,
    Combat,
    Spells,
    Equipment,
    Features,
    Proficiencies,
    Background,
    #[default]
    Other,
    Custom(String),
}

impl ChangeCategory {
    pub const ALL: [Self; 10] = [
        Self::BasicInfo,
        Self::Abilities,
        Self::Skills,
        Self::Combat,
        Self::Spells,
        Self::Equipment,
        Self::Features,
        Self::Proficiencies,
        Self::Background,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BasicInfo => "basic_info",
            Self::Abilities => "abilities",
            Self::Skills => "skills",
            Self::Combat => "combat",
            Self::Spells => "spells",
            Self::Equipment => "equipment",
            Self::Features => "features",
            Self::Proficiencies => "proficiencies",
            Self::Background => "background",
            Self::Other => "other",
            Self::Custom(name) => name,
        }
    }

    /// Resolves a built-in category name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
    }

    /// Resolves any category name, keeping unknown ones as [`Self::Custom`].
    #[must_use]
    pub fn from_name(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| Self::Custom(value.to_string()))
    }
}

impl Serialize for ChangeCategory {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChangeCategory {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_name(&raw))
    }
}

/// Change priority. Variant order is significance order, so `Ord` can be used
/// for `min_priority` style comparisons.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ChangePriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One detected difference between two character snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field_path: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
    pub change_type: ChangeType,
    #[serde(default)]
    pub category: ChangeCategory,
    #[serde(default)]
    pub priority: ChangePriority,
    #[serde(default)]
    pub description: String,
    #[serde(default = "now_utc", with = "timestamp")]
    pub detection_timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl FieldChange {
    #[must_use]
    pub fn new(
        field_path: impl Into<String>,
        old_value: Value,
        new_value: Value,
        change_type: ChangeType,
        category: ChangeCategory,
    ) -> Self {
        Self {
            field_path: field_path.into(),
            old_value,
            new_value,
            change_type,
            category,
            priority: ChangePriority::default(),
            description: String::new(),
            detection_timestamp: now_utc(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: ChangePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Upstream description, or a generated one when upstream left it empty.
    #[must_use]
    pub fn summary(&self) -> String {
        if !self.description.trim().is_empty() {
            return self.description.clone();
        }

        match self.change_type {
            ChangeType::Added => format!(
                "{} added: {}",
                self.field_path,
                display_value(&self.new_value)
            ),
            ChangeType::Removed => format!(
                "{} removed (was {})",
                self.field_path,
                display_value(&self.old_value)
            ),
            ChangeType::Modified | ChangeType::Incremented | ChangeType::Decremented => format!(
                "{} changed from {} to {}",
                self.field_path,
                display_value(&self.old_value),
                display_value(&self.new_value)
            ),
        }
    }
}

/// Compact human rendering of an opaque value.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string),
        other => other.to_string(),
    }
}

/// Why a group of changes happened. One variant per trigger kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "trigger", content = "trigger_details", rename_all = "snake_case")]
pub enum CausationTrigger {
    FeatSelection {
        feat_name: String,
    },
    LevelProgression {
        #[serde(default)]
        class_name: Option<String>,
        level: i64,
        #[serde(default)]
        previous_level: Option<i64>,
    },
    EquipmentChange {
        item_name: String,
        #[serde(default)]
        equipped: Option<bool>,
    },
    AbilityScoreChange {
        ability: String,
        old_score: i64,
        new_score: i64,
        old_modifier: i64,
        new_modifier: i64,
    },
    SubclassSelection {
        #[serde(default)]
        class_name: Option<String>,
        subclass_name: String,
    },
    BackgroundChange {
        background_name: String,
    },
    RaceChange {
        race_name: String,
    },
    Multiclass {
        class_name: String,
        level: i64,
    },
    /// A trigger tag this build does not know; kept verbatim.
    #[serde(skip)]
    Unknown {
        trigger: String,
        details: Map<String, Value>,
    },
}

impl CausationTrigger {
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::FeatSelection { .. } => "feat_selection",
            Self::LevelProgression { .. } => "level_progression",
            Self::EquipmentChange { .. } => "equipment_change",
            Self::AbilityScoreChange { .. } => "ability_score_change",
            Self::SubclassSelection { .. } => "subclass_selection",
            Self::BackgroundChange { .. } => "background_change",
            Self::RaceChange { .. } => "race_change",
            Self::Multiclass { .. } => "multiclass",
            Self::Unknown { trigger, .. } => trigger,
        }
    }

    fn into_parts(self) -> (String, Map<String, Value>) {
        if let Self::Unknown { trigger, details } = self {
            return (trigger, details);
        }

        let tag = self.tag().to_string();
        match serde_json::to_value(&self) {
            Ok(Value::Object(mut object)) => {
                let details = match object.remove("trigger_details") {
                    Some(Value::Object(details)) => details,
                    _ => Map::new(),
                };
                (tag, details)
            }
            _ => (tag, Map::new()),
        }
    }

    fn from_parts(trigger: String, details: Map<String, Value>) -> Self {
        let mut object = Map::new();
        object.insert("trigger".to_string(), Value::String(trigger.clone()));
        object.insert(
            "trigger_details".to_string(),
            Value::Object(details.clone()),
        );
        serde_json::from_value(Value::Object(object))
            .unwrap_or(Self::Unknown { trigger, details })
    }
}

/// An inferred trigger and the field paths believed to be caused by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "CausationWire", into = "CausationWire")]
pub struct ChangeCausation {
    pub trigger: CausationTrigger,
    pub related_changes: Vec<String>,
    pub cascade_depth: u32,
    /// Field path of the change that triggered this causation, when known.
    pub trigger_field: Option<String>,
}

impl ChangeCausation {
    #[must_use]
    pub fn new(trigger: CausationTrigger, trigger_field: Option<String>, cascade_depth: u32) -> Self {
        Self {
            trigger,
            related_changes: Vec::new(),
            cascade_depth,
            trigger_field,
        }
    }

    #[must_use]
    pub fn trigger_tag(&self) -> &str {
        self.trigger.tag()
    }

    /// Appends a related path unless it is already present. Returns whether
    /// the list grew.
    pub fn link(&mut self, field_path: &str) -> bool {
        if self.related_changes.iter().any(|item| item == field_path) {
            return false;
        }
        self.related_changes.push(field_path.to_string());
        true
    }

    #[must_use]
    pub fn explains(&self, field_path: &str) -> bool {
        self.trigger_field.as_deref() == Some(field_path)
            || self.related_changes.iter().any(|item| item == field_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CausationWire {
    trigger: String,
    #[serde(default)]
    trigger_details: Map<String, Value>,
    #[serde(default)]
    related_changes: Vec<String>,
    #[serde(default)]
    cascade_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger_field: Option<String>,
}

impl From<CausationWire> for ChangeCausation {
    fn from(wire: CausationWire) -> Self {
        Self {
            trigger: CausationTrigger::from_parts(wire.trigger, wire.trigger_details),
            related_changes: wire.related_changes,
            cascade_depth: wire.cascade_depth,
            trigger_field: wire.trigger_field,
        }
    }
}

impl From<ChangeCausation> for CausationWire {
    fn from(causation: ChangeCausation) -> Self {
        let (trigger, trigger_details) = causation.trigger.into_parts();
        Self {
            trigger,
            trigger_details,
            related_changes: causation.related_changes,
            cascade_depth: causation.cascade_depth,
            trigger_field: causation.trigger_field,
        }
    }
}

/// Human-facing rendering of a causation. Always derived, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeAttribution {
    pub source: String,
    pub source_name: String,
    pub source_type: String,
    pub impact_summary: String,
}

/// The durable unit written to a change log file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogEntry {
    #[serde(flatten)]
    pub change: FieldChange,
    #[serde(default)]
    pub detailed_description: String,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub character_id: CharacterId,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub causation: Option<ChangeCausation>,
    #[serde(default)]
    pub attribution: Option<ChangeAttribution>,
}

impl ChangeLogEntry {
    #[must_use]
    pub fn new(
        change: FieldChange,
        character_id: CharacterId,
        character_name: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        let detailed_description = change.summary();
        Self {
            change,
            detailed_description,
            timestamp,
            character_id,
            character_name: character_name.into(),
            causation: None,
            attribution: None,
        }
    }

    #[must_use]
    pub fn field_path(&self) -> &str {
        &self.change.field_path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogMetadata {
    pub character_id: CharacterId,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub total_entries: usize,
    #[serde(default)]
    pub change_categories: BTreeMap<String, usize>,
    #[serde(default)]
    pub rotation_count: u32,
    #[serde(default = "default_retention_days")]
    pub retention_policy_days: u32,
    #[serde(with = "timestamp")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub log_file_size: u64,
}

fn default_retention_days() -> u32 {
    ChangeLogConfig::default().retention_days
}

/// One change log file: header plus entries in append (chronological) order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogFile {
    pub metadata: ChangeLogMetadata,
    #[serde(default)]
    pub entries: Vec<ChangeLogEntry>,
}

impl ChangeLogFile {
    #[must_use]
    pub fn new(
        character_id: CharacterId,
        character_name: impl Into<String>,
        retention_policy_days: u32,
        rotation_count: u32,
    ) -> Self {
        Self {
            metadata: ChangeLogMetadata {
                character_id,
                character_name: character_name.into(),
                total_entries: 0,
                change_categories: BTreeMap::new(),
                rotation_count,
                retention_policy_days,
                last_updated: now_utc(),
                log_file_size: 0,
            },
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts
                .entry(entry.change.category.as_str().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    /// Whether the header counters disagree with the entry list.
    #[must_use]
    pub fn has_metadata_drift(&self) -> bool {
        self.metadata.total_entries != self.entries.len()
            || self.metadata.change_categories != self.category_counts()
    }

    /// Recomputes `total_entries` and `change_categories` from the entries.
    pub fn recount(&mut self, as_of: OffsetDateTime) {
        self.metadata.total_entries = self.entries.len();
        self.metadata.change_categories = self.category_counts();
        self.metadata.last_updated = as_of;
    }

    /// Serializes the file as pretty JSON with `log_file_size` filled in.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Serialization`] when encoding fails.
    pub fn encode(&mut self) -> Result<Vec<u8>, ChangeLogError> {
        loop {
            let bytes = serde_json::to_vec_pretty(self)
                .map_err(|err| ChangeLogError::Serialization(err.to_string()))?;
            let size = bytes.len() as u64;
            if size == self.metadata.log_file_size {
                return Ok(bytes);
            }
            // The size field is part of the payload; a new digit count shifts
            // the length, so repeat until it settles.
            self.metadata.log_file_size = size;
        }
    }

    /// Decodes a change log file.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Serialization`] when the payload is not a
    /// structurally valid change log.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChangeLogError> {
        serde_json::from_slice(bytes).map_err(|err| ChangeLogError::Serialization(err.to_string()))
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ChangeLogError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ChangeLogError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ChangeLogError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ChangeLogError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses timestamps found in historical log files: RFC3339 with any offset,
/// or a naive `YYYY-MM-DDTHH:MM:SS[.fraction]` read as UTC.
///
/// # Errors
/// Returns [`ChangeLogError::Validation`] when neither form matches.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, ChangeLogError> {
    if let Ok(parsed) =
        OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
    {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    let layout = if value.contains('.') {
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"
    } else {
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    };
    let naive = time::format_description::parse(layout)
        .map_err(|err| ChangeLogError::Validation(format!("invalid timestamp format: {err}")))?;

    PrimitiveDateTime::parse(value, &naive)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| ChangeLogError::Validation(format!("invalid timestamp {value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ChangeLogError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ChangeLogError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ChangeLogError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Formats a timestamp as `YYYYMMDD_HHMMSS` for use in file names.
///
/// # Errors
/// Returns [`ChangeLogError::Validation`] when formatting fails.
pub fn format_compact(value: OffsetDateTime) -> Result<String, ChangeLogError> {
    let format = time::format_description::parse("[year][month][day]_[hour][minute][second]")
        .map_err(|err| ChangeLogError::Validation(format!("invalid compact format: {err}")))?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| ChangeLogError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// `at` minus `days`, or `None` when that falls outside the representable
/// range. Callers treat `None` as "no cutoff".
#[must_use]
pub fn days_before(at: OffsetDateTime, days: u32) -> Option<OffsetDateTime> {
    at.checked_sub(time::Duration::days(i64::from(days)))
}

/// `at` minus `hours`, or `None` when out of range.
#[must_use]
pub fn hours_before(at: OffsetDateTime, hours: u32) -> Option<OffsetDateTime> {
    at.checked_sub(time::Duration::hours(i64::from(hours)))
}

/// Serde adapter writing RFC3339 UTC and reading via [`parse_timestamp`].
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    /// # Errors
    /// Fails when the input is not a recognised timestamp string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional timestamps; `null` maps to `None`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        /// # Errors
        /// Fails when the timestamp cannot be formatted.
        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not a recognised timestamp string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::super::parse_timestamp(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
