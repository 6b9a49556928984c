//! Human-facing rendering of causations.
//!
//! Attributions are always derived from a [`ChangeCausation`]; they are never
//! authoritative and can be rebuilt at any time.

use crate::{display_value, CausationTrigger, ChangeAttribution, ChangeCausation, FieldChange};

/// Renders `causation` as an attribution for `change`. Infallible: triggers
/// this build does not recognise get [`unknown_attribution`].
#[must_use]
pub fn build_attribution(change: &FieldChange, causation: &ChangeCausation) -> ChangeAttribution {
    let field = change.field_path.as_str();
    match &causation.trigger {
        CausationTrigger::FeatSelection { feat_name } => ChangeAttribution {
            source: "feat".to_string(),
            source_name: feat_name.clone(),
            source_type: "feat".to_string(),
            impact_summary: format!("{feat_name} feat modified {field}"),
        },
        CausationTrigger::LevelProgression {
            class_name, level, ..
        } => {
            let source_name = match class_name {
                Some(class_name) => format!("{} Level {level}", title_case(class_name)),
                None => format!("Level {level}"),
            };
            ChangeAttribution {
                source: "level_progression".to_string(),
                impact_summary: format!("Reaching {source_name} changed {field}"),
                source_name,
                source_type: "class_progression".to_string(),
            }
        }
        CausationTrigger::EquipmentChange { item_name, equipped } => {
            let verb = match equipped {
                Some(true) => "Equipping",
                Some(false) => "Unequipping",
                None => "Changing",
            };
            ChangeAttribution {
                source: "equipment".to_string(),
                source_name: item_name.clone(),
                source_type: "item".to_string(),
                impact_summary: format!("{verb} {item_name} changed {field}"),
            }
        }
        CausationTrigger::AbilityScoreChange {
            ability,
            old_score,
            new_score,
            old_modifier,
            new_modifier,
        } => {
            let ability = title_case(ability);
            ChangeAttribution {
                source: "ability_score".to_string(),
                impact_summary: format!(
                    "{ability} {old_score} -> {new_score} moved its modifier from {} to {}, changing {field}",
                    signed(*old_modifier),
                    signed(*new_modifier)
                ),
                source_name: ability,
                source_type: "ability_improvement".to_string(),
            }
        }
        CausationTrigger::SubclassSelection {
            class_name,
            subclass_name,
        } => {
            let source_name = match class_name {
                Some(class_name) => format!("{subclass_name} ({})", title_case(class_name)),
                None => subclass_name.clone(),
            };
            ChangeAttribution {
                source: "subclass".to_string(),
                impact_summary: format!("Choosing {source_name} changed {field}"),
                source_name,
                source_type: "class_feature".to_string(),
            }
        }
        CausationTrigger::BackgroundChange { background_name } => ChangeAttribution {
            source: "background".to_string(),
            source_name: background_name.clone(),
            source_type: "background".to_string(),
            impact_summary: format!("{background_name} background changed {field}"),
        },
        CausationTrigger::RaceChange { race_name } => ChangeAttribution {
            source: "race".to_string(),
            source_name: race_name.clone(),
            source_type: "species".to_string(),
            impact_summary: format!("{race_name} traits changed {field}"),
        },
        CausationTrigger::Multiclass { class_name, level } => {
            let source_name = format!("{} {level}", title_case(class_name));
            ChangeAttribution {
                source: "multiclass".to_string(),
                impact_summary: format!("Multiclassing into {source_name} changed {field}"),
                source_name,
                source_type: "class_progression".to_string(),
            }
        }
        CausationTrigger::Unknown { .. } => unknown_attribution(change),
    }
}

#[must_use]
pub fn unknown_attribution(change: &FieldChange) -> ChangeAttribution {
    ChangeAttribution {
        source: "unknown".to_string(),
        source_name: "Unknown Source".to_string(),
        source_type: "unknown".to_string(),
        impact_summary: format!("Cause of change to {} is unknown", change.field_path),
    }
}

/// Long-form description stored on the log entry.
#[must_use]
pub fn detailed_description(change: &FieldChange, causation: Option<&ChangeCausation>) -> String {
    let mut text = change.summary();
    if !change.description.trim().is_empty() && change.change_type != crate::ChangeType::Removed {
        text.push_str(&format!(
            " [{} -> {}]",
            display_value(&change.old_value),
            display_value(&change.new_value)
        ));
    }

    let Some(causation) = causation.filter(|item| item.explains(&change.field_path)) else {
        return text;
    };
    if matches!(causation.trigger, CausationTrigger::Unknown { .. }) {
        return text;
    }

    let attribution = build_attribution(change, causation);
    if causation.trigger_field.as_deref() == Some(change.field_path.as_str()) {
        let count = causation.related_changes.len();
        let noun = if count == 1 { "change" } else { "changes" };
        text.push_str(&format!(
            "; {} {} triggered {count} related {noun}",
            attribution.source_type.replace('_', " "),
            attribution.source_name
        ));
    } else {
        text.push_str(&format!(
            "; caused by {} ({})",
            attribution.source_name,
            attribution.source_type.replace('_', " ")
        ));
        if causation.cascade_depth > 0 {
            text.push_str(&format!(", cascade depth {}", causation.cascade_depth));
        }
    }
    text
}

fn title_case(raw: &str) -> String {
    raw.split(['_', ' ', '-'])
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

fn signed(value: i64) -> String {
    if value >= 0 {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeCategory, ChangeType};
    use serde_json::{json, Map};

    fn hp_change() -> FieldChange {
        FieldChange::new(
            "combat.hit_points.maximum",
            json!(42),
            json!(50),
            ChangeType::Incremented,
            ChangeCategory::Combat,
        )
    }

    fn level_up() -> ChangeCausation {
        let mut causation = ChangeCausation::new(
            CausationTrigger::LevelProgression {
                class_name: Some("fighter".to_string()),
                level: 5,
                previous_level: Some(4),
            },
            Some("classes.fighter.level".to_string()),
            0,
        );
        causation.link("combat.hit_points.maximum");
        causation
    }

    #[test]
    fn level_progression_names_class_and_level() {
        let attribution = build_attribution(&hp_change(), &level_up());
        assert_eq!(attribution.source, "level_progression");
        assert_eq!(attribution.source_name, "Fighter Level 5");
        assert_eq!(attribution.source_type, "class_progression");
        assert!(attribution
            .impact_summary
            .contains("combat.hit_points.maximum"));
    }

    #[test]
    fn level_without_class_uses_plain_level() {
        let causation = ChangeCausation::new(
            CausationTrigger::LevelProgression {
                class_name: None,
                level: 3,
                previous_level: Some(2),
            },
            Some("level".to_string()),
            0,
        );
        assert_eq!(
            build_attribution(&hp_change(), &causation).source_name,
            "Level 3"
        );
    }

    #[test]
    fn ability_attribution_reports_signed_modifiers() {
        let causation = ChangeCausation::new(
            CausationTrigger::AbilityScoreChange {
                ability: "dexterity".to_string(),
                old_score: 9,
                new_score: 10,
                old_modifier: -1,
                new_modifier: 0,
            },
            Some("ability_scores.dexterity".to_string()),
            1,
        );
        let attribution = build_attribution(&hp_change(), &causation);
        assert_eq!(attribution.source_name, "Dexterity");
        assert!(attribution.impact_summary.contains("from -1 to +0"));
    }

    #[test]
    fn unknown_trigger_falls_back_to_unknown_source() {
        let causation = ChangeCausation::new(
            CausationTrigger::Unknown {
                trigger: "divine_intervention".to_string(),
                details: Map::new(),
            },
            None,
            0,
        );
        let attribution = build_attribution(&hp_change(), &causation);
        assert_eq!(attribution, unknown_attribution(&hp_change()));
        assert_eq!(attribution.source, "unknown");
    }

    #[test]
    fn detailed_description_mentions_cause_for_related_fields() {
        let text = detailed_description(&hp_change(), Some(&level_up()));
        assert_eq!(
            text,
            "combat.hit_points.maximum changed from 42 to 50; caused by Fighter Level 5 (class progression)"
        );
    }

    #[test]
    fn detailed_description_for_trigger_counts_related_changes() {
        let trigger = FieldChange::new(
            "classes.fighter.level",
            json!(4),
            json!(5),
            ChangeType::Incremented,
            ChangeCategory::BasicInfo,
        );
        let text = detailed_description(&trigger, Some(&level_up()));
        assert!(text.ends_with("class progression Fighter Level 5 triggered 1 related change"));
    }

    #[test]
    fn detailed_description_ignores_unrelated_causation() {
        let unrelated = FieldChange::new(
            "skills.arcana",
            json!(2),
            json!(3),
            ChangeType::Incremented,
            ChangeCategory::Skills,
        );
        let text = detailed_description(&unrelated, Some(&level_up()));
        assert_eq!(text, "skills.arcana changed from 2 to 3");
    }
}
