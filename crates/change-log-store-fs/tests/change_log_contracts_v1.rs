use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use change_log_core::{
    ChangeCategory, ChangeLogConfig, ChangeLogFile, ChangeType, CharacterId, FieldChange,
};
use change_log_store_fs::{ChangeLogService, FilterOperator, QueryFilter, QueryOptions};
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn schema_path() -> PathBuf {
    repo_root().join("contracts/change-log/v1/schemas/change-log-file.schema.json")
}

async fn open_service() -> (PathBuf, ChangeLogService) {
    let dir = std::env::temp_dir().join(format!("change-log-contracts-{}", Ulid::new()));
    let config = ChangeLogConfig::default().with_storage_dir(&dir);
    let service = ChangeLogService::open(config)
        .await
        .unwrap_or_else(|err| panic!("failed to open service: {err:#}"));
    (dir, service)
}

fn level_up_diff() -> (Vec<FieldChange>, Value, Value) {
    let changes = vec![
        FieldChange::new(
            "classes.fighter.level",
            json!(4),
            json!(5),
            ChangeType::Incremented,
            ChangeCategory::BasicInfo,
        ),
        FieldChange::new(
            "combat.hit_points.maximum",
            json!(42),
            json!(50),
            ChangeType::Incremented,
            ChangeCategory::Combat,
        ),
    ];
    let old = json!({"name": "Aria", "classes": [{"name": "Fighter", "level": 4}], "combat": {"hit_points": {"maximum": 42}}});
    let new = json!({"name": "Aria", "classes": [{"name": "Fighter", "level": 5}], "combat": {"hit_points": {"maximum": 50}}});
    (changes, old, new)
}

#[test]
fn sample_fixture_matches_schema_and_decodes() {
    let fixture_path = repo_root().join("contracts/change-log/v1/fixtures/change-log-file.sample.json");
    let fixture = read_json(&fixture_path);
    assert_schema(&schema_path(), &fixture);

    let bytes = fs::read(&fixture_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", fixture_path.display()));
    let file = ChangeLogFile::decode(&bytes)
        .unwrap_or_else(|err| panic!("fixture failed to decode: {err}"));
    assert!(!file.has_metadata_drift());
    assert_eq!(file.entries.len(), 2);
}

#[tokio::test]
async fn level_up_round_trips_through_service_and_query() {
    let (dir, service) = open_service().await;
    let (changes, old, new) = level_up_diff();

    assert!(
        service
            .log_changes(CharacterId(12_345), "Aria Stormwind", changes, &old, &new)
            .await
    );

    let history = service
        .get_change_history(CharacterId(12_345), None, None)
        .await
        .unwrap_or_else(|err| panic!("history failed: {err:#}"));
    assert_eq!(history.len(), 2);
    let triggers: BTreeSet<&str> = history
        .iter()
        .filter_map(|entry| entry.causation.as_ref())
        .map(|causation| causation.trigger_tag())
        .collect();
    assert_eq!(triggers, BTreeSet::from(["level_progression"]));

    let by_cause = service
        .query()
        .get_changes_by_cause(CharacterId(12_345), "level_progression", Some("Level 5"))
        .await
        .unwrap_or_else(|err| panic!("cause lookup failed: {err:#}"));
    assert!(by_cause
        .iter()
        .any(|entry| entry.field_path() == "combat.hit_points.maximum"));

    let receipt_path = service
        .store()
        .locator()
        .current_path(CharacterId(12_345), "Aria Stormwind");
    assert!(receipt_path.ends_with("Aria_Stormwind_12345_changes.json"));
    assert_schema(&schema_path(), &read_json(&receipt_path));

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn category_and_custom_filters_combine_with_and() {
    let (dir, service) = open_service().await;
    let changes = vec![
        FieldChange::new(
            "combat.attacks.strength_bonus",
            json!(2),
            json!(3),
            ChangeType::Incremented,
            ChangeCategory::Combat,
        ),
        FieldChange::new(
            "combat.armor_class",
            json!(15),
            json!(16),
            ChangeType::Incremented,
            ChangeCategory::Combat,
        ),
        FieldChange::new(
            "ability_scores.strength",
            json!(14),
            json!(15),
            ChangeType::Incremented,
            ChangeCategory::Abilities,
        ),
    ];
    assert!(
        service
            .log_changes(CharacterId(9), "Bran", changes, &json!({}), &json!({}))
            .await
    );

    let options = QueryOptions {
        categories: BTreeSet::from([ChangeCategory::Combat]),
        custom_filters: vec![QueryFilter::new(
            "field_path",
            FilterOperator::Contains,
            json!("strength"),
        )],
        ..QueryOptions::default()
    };
    let result = service
        .query()
        .query(CharacterId(9), &options)
        .await
        .unwrap_or_else(|err| panic!("query failed: {err:#}"));

    assert_eq!(result.total_count, 3);
    assert_eq!(result.filtered_count, 1);
    assert_eq!(result.entries[0].field_path(), "combat.attacks.strength_bonus");

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
