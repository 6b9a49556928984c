//! Rule-based inference of why a batch of field changes happened.
//!
//! Each trigger kind has a detector that finds trigger changes in the batch
//! and then searches the remaining changes for effect fields. Effect matching
//! is a pure function over a rule table of precompiled glob patterns that is
//! built once per analyzer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};

use serde_json::Value;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::{CausationTrigger, ChangeCausation, ChangeLogError, ChangeType, FieldChange};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TriggerKind {
    Feat,
    Level,
    Equipment,
    AbilityScore,
    Subclass,
    Background,
    Race,
    Multiclass,
}

impl TriggerKind {
    /// Detector execution order.
    pub const ALL: [Self; 8] = [
        Self::Feat,
        Self::Level,
        Self::Equipment,
        Self::AbilityScore,
        Self::Subclass,
        Self::Background,
        Self::Race,
        Self::Multiclass,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feat => "feat",
            Self::Level => "level",
            Self::Equipment => "equipment",
            Self::AbilityScore => "ability_score",
            Self::Subclass => "subclass",
            Self::Background => "background",
            Self::Race => "race",
            Self::Multiclass => "multiclass",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Ability score shifts are usually caused by something else (a feat, a
    /// level-up), so they start one level down.
    #[must_use]
    pub fn default_cascade_depth(self) -> u32 {
        match self {
            Self::AbilityScore => 1,
            _ => 0,
        }
    }
}

const GENERIC_EFFECTS: [(TriggerKind, &[&str]); 8] = [
    (
        TriggerKind::Feat,
        &[
            "*proficienc*",
            "*skill*",
            "*ability_score*",
            "*spell*",
            "*combat*",
            "*attack*",
            "*damage*",
            "*bonus_action*",
            "*reaction*",
            "*passive*",
        ],
    ),
    (
        TriggerKind::Level,
        &[
            "*hit_point*",
            "*spell_slot*",
            "*proficiency_bonus*",
            "*feature*",
            "*class_feature*",
            "*subclass*",
            "*ability_score*",
            "*spell*",
        ],
    ),
    (
        TriggerKind::Equipment,
        &[
            "*armor_class*",
            "*attack_bonus*",
            "*damage*",
            "*ability_score*",
            "*skill*",
            "*saving_throw*",
            "*speed*",
        ],
    ),
    (
        TriggerKind::AbilityScore,
        &[
            "*skill*",
            "*saving_throw*",
            "*spell_attack*",
            "*spell_save_dc*",
            "*initiative*",
            "*passive*",
            "*modifier*",
            "*bonus*",
        ],
    ),
    (
        TriggerKind::Subclass,
        &["*feature*", "*spell*", "*proficienc*", "*skill*", "*combat*"],
    ),
    (
        TriggerKind::Background,
        &["*proficienc*", "*skill*", "*language*", "*tool*", "*equipment*"],
    ),
    (
        TriggerKind::Race,
        &[
            "*ability_score*",
            "*proficienc*",
            "*trait*",
            "*speed*",
            "*size*",
            "*language*",
            "*skill*",
            "*resistance*",
            "*immunity*",
        ],
    ),
    (
        TriggerKind::Multiclass,
        &[
            "*spell_slot*",
            "*proficienc*",
            "*feature*",
            "*hit_point*",
            "*spell*",
            "*skill*",
            "*saving_throw*",
        ],
    ),
];

const SPECIFIC_EFFECTS: &[(TriggerKind, &str, &[&str])] = &[
    (
        TriggerKind::Feat,
        "*great_weapon_master*",
        &["*combat*attack*", "*attack*", "*damage*", "*bonus_action*"],
    ),
    (
        TriggerKind::Feat,
        "*sharpshooter*",
        &["*ranged*", "*attack*", "*damage*"],
    ),
    (
        TriggerKind::Feat,
        "*war_caster*",
        &["*concentration*", "*spell*", "*reaction*"],
    ),
    (TriggerKind::Feat, "*alert*", &["*initiative*"]),
    (TriggerKind::Feat, "*tough*", &["*hit_point*"]),
    (
        TriggerKind::Feat,
        "*observant*",
        &["*passive*", "*ability_score*"],
    ),
    (
        TriggerKind::Feat,
        "*resilient*",
        &["*saving_throw*", "*ability_score*"],
    ),
    (TriggerKind::Feat, "*mobile*", &["*speed*"]),
    (
        TriggerKind::Feat,
        "*magic_initiate*",
        &["*spell*", "*cantrip*"],
    ),
    (TriggerKind::Feat, "*skilled*", &["*skill*", "*proficienc*"]),
    (
        TriggerKind::Feat,
        "*sentinel*",
        &["*reaction*", "*opportunity_attack*"],
    ),
    (TriggerKind::Equipment, "*shield*", &["*armor_class*"]),
    (
        TriggerKind::Equipment,
        "*armor*",
        &["*armor_class*", "*speed*", "*stealth*"],
    ),
    (
        TriggerKind::Equipment,
        "*of_protection*",
        &["*armor_class*", "*saving_throw*"],
    ),
    (
        TriggerKind::Race,
        "*dwarf*",
        &["*speed*", "*resistance*", "*constitution*"],
    ),
    (
        TriggerKind::Race,
        "*elf*",
        &["*perception*", "*darkvision*", "*dexterity*"],
    ),
];

/// A glob pattern (`*`, `?`) matched against lower-cased field paths.
pub struct RulePattern {
    raw: String,
    matcher: WildMatch,
}

impl RulePattern {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        let raw = raw.to_ascii_lowercase();
        let matcher = WildMatch::new(&raw);
        Self { raw, matcher }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `lowered` must already be lower-case.
    #[must_use]
    pub fn matches(&self, lowered: &str) -> bool {
        self.matcher.matches(lowered)
    }
}

impl Clone for RulePattern {
    fn clone(&self) -> Self {
        Self::new(&self.raw)
    }
}

impl Debug for RulePattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RulePattern").field(&self.raw).finish()
    }
}

/// Effect patterns that apply only when the trigger's normalized name
/// matches `key`.
#[derive(Debug, Clone)]
pub struct SpecificRule {
    pub key: RulePattern,
    pub effects: Vec<RulePattern>,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerRules {
    pub specific: Vec<SpecificRule>,
    pub generic: Vec<RulePattern>,
}

#[derive(Debug, Clone)]
pub struct CausationRules {
    rules: BTreeMap<TriggerKind, TriggerRules>,
}

impl Default for CausationRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CausationRules {
    #[must_use]
    pub fn builtin() -> Self {
        let mut rules: BTreeMap<TriggerKind, TriggerRules> = BTreeMap::new();
        for (kind, patterns) in GENERIC_EFFECTS {
            rules.entry(kind).or_default().generic =
                patterns.iter().map(|raw| RulePattern::new(raw)).collect();
        }
        for (kind, key, effects) in SPECIFIC_EFFECTS {
            rules.entry(*kind).or_default().specific.push(SpecificRule {
                key: RulePattern::new(key),
                effects: effects.iter().map(|raw| RulePattern::new(raw)).collect(),
            });
        }
        Self { rules }
    }

    /// Extends the table with rules from JSON of the form
    /// `{"feat": {"generic": ["*x*"], "specific": {"*key*": ["*y*"]}}}`.
    ///
    /// # Errors
    /// Returns [`ChangeLogError::Configuration`] for unknown trigger kinds or
    /// payloads of the wrong shape. The table is unchanged on error.
    pub fn merge_json(&mut self, value: &Value) -> Result<(), ChangeLogError> {
        let Some(object) = value.as_object() else {
            return Err(ChangeLogError::Configuration(
                "causation rules MUST be a JSON object keyed by trigger kind".to_string(),
            ));
        };

        let mut staged = self.rules.clone();
        for (kind_raw, body) in object {
            let kind = TriggerKind::parse(kind_raw).ok_or_else(|| {
                ChangeLogError::Configuration(format!("unknown trigger kind in rules: {kind_raw}"))
            })?;
            let entry = staged.entry(kind).or_default();

            if let Some(generic) = body.get("generic") {
                for raw in string_list(generic, kind_raw, "generic")? {
                    if !entry.generic.iter().any(|item| item.as_str() == raw.to_ascii_lowercase()) {
                        entry.generic.push(RulePattern::new(&raw));
                    }
                }
            }

            if let Some(specific) = body.get("specific") {
                let Some(specific) = specific.as_object() else {
                    return Err(ChangeLogError::Configuration(format!(
                        "{kind_raw}.specific MUST be an object of pattern lists"
                    )));
                };
                for (key, effects) in specific {
                    let effects = string_list(effects, kind_raw, key)?;
                    entry.specific.push(SpecificRule {
                        key: RulePattern::new(key),
                        effects: effects.iter().map(|raw| RulePattern::new(raw)).collect(),
                    });
                }
            }
        }

        self.rules = staged;
        Ok(())
    }

    #[must_use]
    pub fn for_kind(&self, kind: TriggerKind) -> Option<&TriggerRules> {
        self.rules.get(&kind)
    }
}

fn string_list(value: &Value, kind: &str, field: &str) -> Result<Vec<String>, ChangeLogError> {
    let Some(items) = value.as_array() else {
        return Err(ChangeLogError::Configuration(format!(
            "{kind}.{field} MUST be a list of patterns"
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ChangeLogError::Configuration(format!("{kind}.{field} MUST contain only strings"))
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorFailure {
    pub detector: TriggerKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    pub causations: Vec<ChangeCausation>,
    pub failures: Vec<DetectorFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct CausationAnalyzer {
    rules: CausationRules,
}

impl CausationAnalyzer {
    #[must_use]
    pub fn new(rules: CausationRules) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rules(&self) -> &CausationRules {
        &self.rules
    }

    /// Infers causations for a batch of changes. Never fails: a detector that
    /// errors is logged and contributes nothing.
    #[must_use]
    pub fn analyze(
        &self,
        changes: &[FieldChange],
        old_snapshot: &Value,
        new_snapshot: &Value,
    ) -> Vec<ChangeCausation> {
        self.analyze_with_report(changes, old_snapshot, new_snapshot)
            .causations
    }

    #[must_use]
    pub fn analyze_with_report(
        &self,
        changes: &[FieldChange],
        old_snapshot: &Value,
        new_snapshot: &Value,
    ) -> AnalysisReport {
        let ctx = AnalysisContext::new(changes, old_snapshot, new_snapshot);
        let mut report = AnalysisReport::default();

        for kind in TriggerKind::ALL {
            match self.detect(kind, &ctx) {
                Ok(mut found) => report.causations.append(&mut found),
                Err(err) => {
                    warn!(detector = kind.as_str(), error = %err, "causation detector failed; skipping");
                    report.failures.push(DetectorFailure {
                        detector: kind,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.link_cascades(changes, &mut report.causations);
        report
    }

    /// Links secondary effects to each causation: a change is linked when a
    /// token of its last path segment also appears in the path of a change
    /// the causation already explains. Runs to a fixpoint, so calling it
    /// again on its own output changes nothing.
    pub fn link_cascades(&self, changes: &[FieldChange], causations: &mut [ChangeCausation]) {
        let trigger_fields: BTreeSet<String> = causations
            .iter()
            .filter_map(|causation| causation.trigger_field.clone())
            .collect();

        for causation in causations.iter_mut() {
            let mut cursor = 0;
            while cursor < causation.related_changes.len() {
                let source_tokens = path_tokens(&causation.related_changes[cursor]);
                for change in changes {
                    let path = change.field_path.as_str();
                    if causation.explains(path) || trigger_fields.contains(path) {
                        continue;
                    }
                    let overlaps = last_segment_tokens(path)
                        .iter()
                        .any(|token| source_tokens.contains(token));
                    if overlaps && causation.link(path) {
                        debug!(
                            trigger = causation.trigger_tag(),
                            field_path = path,
                            "linked cascading change"
                        );
                    }
                }
                cursor += 1;
            }
        }
    }

    fn detect(
        &self,
        kind: TriggerKind,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Vec<ChangeCausation>, ChangeLogError> {
        let Some(rules) = self.rules.for_kind(kind) else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        for (index, change) in ctx.changes.iter().enumerate() {
            let identified = match kind {
                TriggerKind::Feat => identify_feat(ctx, index),
                TriggerKind::Level => identify_level(ctx, index)?,
                TriggerKind::Equipment => identify_equipment(ctx, index),
                TriggerKind::AbilityScore => identify_ability_score(ctx, index)?,
                TriggerKind::Subclass => identify_subclass(ctx, index),
                TriggerKind::Background => identify_background(ctx, index),
                TriggerKind::Race => identify_race(ctx, index),
                TriggerKind::Multiclass => identify_multiclass(ctx, index)?,
            };
            let Some(Identified { trigger, key }) = identified else {
                continue;
            };

            let related = collect_effects(ctx, index, rules, key.as_deref());
            if related.is_empty() {
                debug!(
                    detector = kind.as_str(),
                    field_path = change.field_path.as_str(),
                    "trigger without effects; not reported"
                );
                continue;
            }

            let mut causation = ChangeCausation::new(
                trigger,
                Some(change.field_path.clone()),
                kind.default_cascade_depth(),
            );
            for path in &related {
                causation.link(path);
            }
            found.push(causation);
        }

        Ok(found)
    }
}

/// First causation that explains `field_path`, in analyzer order.
#[must_use]
pub fn causation_for<'a>(
    field_path: &str,
    causations: &'a [ChangeCausation],
) -> Option<&'a ChangeCausation> {
    causations
        .iter()
        .find(|causation| causation.explains(field_path))
}

struct AnalysisContext<'a> {
    changes: &'a [FieldChange],
    lowered: Vec<String>,
    old: &'a Value,
    new: &'a Value,
}

impl<'a> AnalysisContext<'a> {
    fn new(changes: &'a [FieldChange], old: &'a Value, new: &'a Value) -> Self {
        let lowered = changes
            .iter()
            .map(|change| change.field_path.to_ascii_lowercase())
            .collect();
        Self {
            changes,
            lowered,
            old,
            new,
        }
    }

    fn segments(&self, index: usize) -> Vec<&str> {
        self.lowered[index].split('.').collect()
    }
}

struct Identified {
    trigger: CausationTrigger,
    /// Normalized name used to select specific rules.
    key: Option<String>,
}

fn collect_effects(
    ctx: &AnalysisContext<'_>,
    trigger_index: usize,
    rules: &TriggerRules,
    key: Option<&str>,
) -> Vec<String> {
    if let Some(key) = key {
        let specific: Vec<&RulePattern> = rules
            .specific
            .iter()
            .filter(|rule| rule.key.matches(key))
            .flat_map(|rule| rule.effects.iter())
            .collect();
        if !specific.is_empty() {
            let found = paths_matching(ctx, trigger_index, &specific);
            if !found.is_empty() {
                return found;
            }
        }
    }

    let generic: Vec<&RulePattern> = rules.generic.iter().collect();
    paths_matching(ctx, trigger_index, &generic)
}

fn paths_matching(
    ctx: &AnalysisContext<'_>,
    trigger_index: usize,
    patterns: &[&RulePattern],
) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for (index, change) in ctx.changes.iter().enumerate() {
        if index == trigger_index {
            continue;
        }
        let lowered = &ctx.lowered[index];
        if patterns.iter().any(|pattern| pattern.matches(lowered))
            && !found.iter().any(|item| item == &change.field_path)
        {
            found.push(change.field_path.clone());
        }
    }
    found
}

fn identify_feat(ctx: &AnalysisContext<'_>, index: usize) -> Option<Identified> {
    let change = &ctx.changes[index];
    if change.change_type == ChangeType::Removed || change.new_value.is_null() {
        return None;
    }

    let segments = ctx.segments(index);
    if !segments.iter().any(|segment| is_feat_segment(segment)) {
        return None;
    }

    let feat_name = value_name(&change.new_value)
        .or_else(|| {
            segments
                .last()
                .filter(|segment| !is_feat_segment(segment) && !is_index(segment))
                .map(|segment| humanize(segment))
        })
        .unwrap_or_else(|| "Unknown Feat".to_string());

    Some(Identified {
        key: Some(normalize_key(&feat_name)),
        trigger: CausationTrigger::FeatSelection { feat_name },
    })
}

fn identify_level(
    ctx: &AnalysisContext<'_>,
    index: usize,
) -> Result<Option<Identified>, ChangeLogError> {
    let change = &ctx.changes[index];
    let segments = ctx.segments(index);

    let class_segment = match segments.as_slice() {
        ["classes", class, "level"] => Some(*class),
        other if is_total_level_path(other) => None,
        _ => return Ok(None),
    };

    let previous = as_int(&change.old_value, &change.field_path)?;
    let Some(level) = as_int(&change.new_value, &change.field_path)? else {
        return Ok(None);
    };
    // A class rising from nothing is a multiclass, not a level-up.
    let Some(previous_level) = previous.filter(|value| *value > 0) else {
        return Ok(None);
    };
    if level <= previous_level {
        return Ok(None);
    }

    let class_name = class_segment.map(|segment| resolve_class_name(ctx, segment));
    Ok(Some(Identified {
        key: class_name.as_deref().map(normalize_key),
        trigger: CausationTrigger::LevelProgression {
            class_name,
            level,
            previous_level: Some(previous_level),
        },
    }))
}

fn identify_equipment(ctx: &AnalysisContext<'_>, index: usize) -> Option<Identified> {
    let change = &ctx.changes[index];
    let segments = ctx.segments(index);
    if segments.len() < 2 || !matches!(segments[0], "equipment" | "inventory") {
        return None;
    }

    let last = segments[segments.len() - 1];
    let flag_change = matches!(last, "equipped" | "is_equipped" | "attuned" | "is_attuned");
    if !flag_change && !matches!(change.change_type, ChangeType::Added | ChangeType::Removed) {
        return None;
    }

    let item_segment = segments[1];
    let item_name = value_name(&change.new_value)
        .or_else(|| value_name(&change.old_value))
        .or_else(|| {
            is_index(item_segment)
                .then(|| snapshot_item_name(ctx, segments[0], item_segment))
                .flatten()
        })
        .unwrap_or_else(|| humanize(item_segment));

    let equipped = if flag_change {
        change.new_value.as_bool()
    } else {
        Some(change.change_type == ChangeType::Added)
    };

    Some(Identified {
        key: Some(normalize_key(&item_name)),
        trigger: CausationTrigger::EquipmentChange {
            item_name,
            equipped,
        },
    })
}

const ABILITIES: [(&str, &str); 6] = [
    ("strength", "str"),
    ("dexterity", "dex"),
    ("constitution", "con"),
    ("intelligence", "int"),
    ("wisdom", "wis"),
    ("charisma", "cha"),
];

const ABILITY_CONTAINERS: [&str; 4] = ["ability_scores", "abilities", "stats", "ability_score"];

fn identify_ability_score(
    ctx: &AnalysisContext<'_>,
    index: usize,
) -> Result<Option<Identified>, ChangeLogError> {
    let change = &ctx.changes[index];
    let segments = ctx.segments(index);

    let Some(container) = segments
        .iter()
        .position(|segment| ABILITY_CONTAINERS.contains(segment))
    else {
        return Ok(None);
    };
    let Some(ability) = segments[container + 1..]
        .iter()
        .find_map(|segment| ability_name(segment))
    else {
        return Ok(None);
    };
    if matches!(
        segments.last().copied(),
        Some("modifier" | "mod" | "bonus" | "save" | "saving_throw")
    ) {
        return Ok(None);
    }

    let (Some(old_score), Some(new_score)) = (
        as_int(&change.old_value, &change.field_path)?,
        as_int(&change.new_value, &change.field_path)?,
    ) else {
        return Ok(None);
    };

    let old_modifier = ability_modifier(old_score);
    let new_modifier = ability_modifier(new_score);
    if old_modifier == new_modifier {
        return Ok(None);
    }

    Ok(Some(Identified {
        key: Some(ability.to_string()),
        trigger: CausationTrigger::AbilityScoreChange {
            ability: ability.to_string(),
            old_score,
            new_score,
            old_modifier,
            new_modifier,
        },
    }))
}

fn identify_subclass(ctx: &AnalysisContext<'_>, index: usize) -> Option<Identified> {
    let change = &ctx.changes[index];
    if change.change_type == ChangeType::Removed || change.new_value.is_null() {
        return None;
    }

    let segments = ctx.segments(index);
    let position = segments
        .iter()
        .position(|segment| matches!(*segment, "subclass" | "subclass_name"))?;
    let trailing = &segments[position + 1..];
    if !(trailing.is_empty() || matches!(trailing, ["name" | "id"])) {
        return None;
    }

    let class_name = position
        .checked_sub(1)
        .map(|prev| segments[prev])
        .filter(|segment| *segment != "classes")
        .map(|segment| resolve_class_name(ctx, segment));
    let subclass_name =
        value_name(&change.new_value).unwrap_or_else(|| "Unknown Subclass".to_string());

    Some(Identified {
        key: Some(normalize_key(&subclass_name)),
        trigger: CausationTrigger::SubclassSelection {
            class_name,
            subclass_name,
        },
    })
}

fn identify_background(ctx: &AnalysisContext<'_>, index: usize) -> Option<Identified> {
    let background_name = identify_named(ctx, index, &["background"])?;
    Some(Identified {
        key: Some(normalize_key(&background_name)),
        trigger: CausationTrigger::BackgroundChange { background_name },
    })
}

fn identify_race(ctx: &AnalysisContext<'_>, index: usize) -> Option<Identified> {
    let race_name = identify_named(ctx, index, &["race", "species"])?;
    Some(Identified {
        key: Some(normalize_key(&race_name)),
        trigger: CausationTrigger::RaceChange { race_name },
    })
}

/// Matches `x.<name>` or `x.<name>.name|id` and returns the new value's name.
fn identify_named(ctx: &AnalysisContext<'_>, index: usize, names: &[&str]) -> Option<String> {
    let change = &ctx.changes[index];
    if change.change_type == ChangeType::Removed || change.new_value.is_null() {
        return None;
    }

    let segments = ctx.segments(index);
    if segments.len() > 3 {
        return None;
    }
    let last = *segments.last()?;
    let named = names.contains(&last)
        || (segments.len() >= 2
            && names.contains(&segments[segments.len() - 2])
            && matches!(last, "name" | "id"));
    if !named {
        return None;
    }

    Some(value_name(&change.new_value).unwrap_or_else(|| "Unknown".to_string()))
}

fn identify_multiclass(
    ctx: &AnalysisContext<'_>,
    index: usize,
) -> Result<Option<Identified>, ChangeLogError> {
    let change = &ctx.changes[index];
    let segments = ctx.segments(index);

    let (class_segment, old_level, new_level) = match segments.as_slice() {
        ["classes", class, "level"] => (
            *class,
            as_int(&change.old_value, &change.field_path)?,
            as_int(&change.new_value, &change.field_path)?,
        ),
        ["classes", class] => (
            *class,
            as_int(
                change.old_value.get("level").unwrap_or(&Value::Null),
                &change.field_path,
            )?,
            as_int(
                change.new_value.get("level").unwrap_or(&Value::Null),
                &change.field_path,
            )?,
        ),
        _ => return Ok(None),
    };

    let Some(level) = new_level.filter(|value| *value >= 1) else {
        return Ok(None);
    };
    let newly_added = change.change_type == ChangeType::Added || old_level.unwrap_or(0) == 0;
    if !newly_added {
        return Ok(None);
    }
    if matches!(class_count(ctx.new), Some(count) if count < 2) {
        return Ok(None);
    }

    let class_name = resolve_class_name(ctx, class_segment);
    let class_prefix = format!("classes.{class_segment}");
    let removed_in_batch = ctx.changes.iter().enumerate().any(|(other, item)| {
        other != index
            && item.change_type == ChangeType::Removed
            && ctx.lowered[other].starts_with(&class_prefix)
    });
    if removed_in_batch {
        warn!(
            class_name = class_name.as_str(),
            "class removed and re-added in one batch; multiclass causation may double count"
        );
    }

    Ok(Some(Identified {
        key: Some(normalize_key(&class_name)),
        trigger: CausationTrigger::Multiclass { class_name, level },
    }))
}

fn is_feat_segment(segment: &str) -> bool {
    segment == "feat"
        || segment == "feats"
        || segment.starts_with("feat_")
        || segment.ends_with("_feat")
        || segment.ends_with("_feats")
}

fn is_total_level_path(segments: &[&str]) -> bool {
    let is_level = |segment: &str| matches!(segment, "level" | "character_level" | "total_level");
    match segments {
        [last] => is_level(last),
        [parent, last] => {
            matches!(*parent, "basic_info" | "character_info" | "character" | "info")
                && is_level(last)
        }
        _ => false,
    }
}

fn ability_name(segment: &str) -> Option<&'static str> {
    ABILITIES
        .iter()
        .find(|(full, short)| segment == *full || segment == *short)
        .map(|(full, _)| *full)
}

/// Standard modifier: `floor((score - 10) / 2)`.
#[must_use]
pub fn ability_modifier(score: i64) -> i64 {
    (score - 10).div_euclid(2)
}

fn as_int(value: &Value, field_path: &str) -> Result<Option<i64>, ChangeLogError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|float| float.fract() == 0.0 && float.is_finite())
                    .map(|float| {
                        #[allow(clippy::cast_possible_truncation)]
                        let whole = float as i64;
                        whole
                    })
            })
            .map(Some)
            .ok_or_else(|| {
                ChangeLogError::Validation(format!("{field_path}: expected an integer, got {number}"))
            }),
        Value::String(text) => text.trim().parse::<i64>().map(Some).map_err(|_| {
            ChangeLogError::Validation(format!("{field_path}: expected an integer, got {text:?}"))
        }),
        other => Err(ChangeLogError::Validation(format!(
            "{field_path}: expected an integer, got {other}"
        ))),
    }
}

fn value_name(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("definition").and_then(|definition| definition.get("name")))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|byte| byte.is_ascii_digit())
}

fn class_entry<'v>(snapshot: &'v Value, segment: &str) -> Option<&'v Value> {
    let classes = snapshot.get("classes")?;
    match classes {
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|position| items.get(position)),
        Value::Object(map) => map.get(segment),
        _ => None,
    }
}

fn resolve_class_name(ctx: &AnalysisContext<'_>, segment: &str) -> String {
    if !is_index(segment) {
        return segment.to_string();
    }
    class_entry(ctx.new, segment)
        .or_else(|| class_entry(ctx.old, segment))
        .and_then(value_name)
        .map_or_else(|| format!("class {segment}"), |name| name.to_ascii_lowercase())
}

fn snapshot_item_name(ctx: &AnalysisContext<'_>, container: &str, segment: &str) -> Option<String> {
    let position = segment.parse::<usize>().ok()?;
    [ctx.new, ctx.old].into_iter().find_map(|snapshot| {
        snapshot
            .get(container)
            .and_then(Value::as_array)
            .and_then(|items| items.get(position))
            .and_then(value_name)
    })
}

fn class_count(snapshot: &Value) -> Option<usize> {
    match snapshot.get("classes")? {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn humanize(segment: &str) -> String {
    segment
        .split(['_', '-'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

const STOP_TOKENS: [&str; 7] = ["value", "name", "total", "bonus", "level", "count", "current"];

fn tokens(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(['.', '_'])
        .filter(|token| token.len() >= 4 && !is_index(token) && !STOP_TOKENS.contains(token))
        .map(str::to_string)
        .collect()
}

fn path_tokens(path: &str) -> BTreeSet<String> {
    tokens(path).into_iter().collect()
}

fn last_segment_tokens(path: &str) -> Vec<String> {
    tokens(path.rsplit('.').next().unwrap_or(path))
}
