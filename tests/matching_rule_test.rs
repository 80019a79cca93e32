//! Matching rule CRUD and criteria validation.

mod common;

use common::*;
use recon_core::error::AppError;
use recon_core::models::Criterion;
use recon_core::services::Store;
use serde_json::json;
use std::time::Duration;

fn num(v: &str) -> serde_json::Number {
    serde_json::from_str(v).unwrap()
}

#[tokio::test]
async fn a_rule_round_trips_through_the_store() {
    let app = spawn_app();
    let rule = rule(
        "rule_1",
        "Card settlements",
        vec![
            Criterion::new("amount", "within_tolerance")
                .with_value(json!("percent"))
                .with_tolerance(num("0.01")),
            Criterion::new("currency", "equals"),
            Criterion::new("description", "similar").with_value(json!(0.85)),
        ],
    );
    app.store.record_matching_rule(&rule).await.unwrap();

    let fetched = app.store.get_matching_rule("rule_1").await.unwrap();
    assert_eq!(fetched.name, "Card settlements");
    assert_eq!(fetched.criteria, rule.criteria);
}

#[tokio::test]
async fn rules_with_invalid_criteria_are_rejected_at_insert_time() {
    let app = spawn_app();

    let empty = rule("rule_empty", "No criteria", vec![]);
    let err = app.store.record_matching_rule(&empty).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let unknown_field = rule(
        "rule_field",
        "Unknown field",
        vec![Criterion::new("memo", "equals")],
    );
    let err = app.store.record_matching_rule(&unknown_field).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let unknown_operator = rule(
        "rule_op",
        "Unknown operator",
        vec![Criterion::new("description", "regex")],
    );
    let err = app.store.record_matching_rule(&unknown_operator).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let mut drift = Criterion::new("reference", "equals");
    drift.allowable_drift = Some(num("0.4"));
    let with_drift = rule("rule_drift", "Allowable drift", vec![drift]);
    let err = app.store.record_matching_rule(&with_drift).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let missing_tolerance = rule(
        "rule_tol",
        "Missing tolerance",
        vec![Criterion::new("amount", "within_tolerance")],
    );
    let err = app
        .store
        .record_matching_rule(&missing_tolerance)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    // Nothing invalid was persisted.
    assert!(app.store.get_matching_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_rule_ids_are_rejected() {
    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_dup")).await.unwrap();
    let err = app
        .store
        .record_matching_rule(&exact_rule("rule_dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));
}

#[tokio::test]
async fn update_refreshes_updated_at_and_validates() {
    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_1")).await.unwrap();
    let created = app.store.get_matching_rule("rule_1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut updated = created.clone();
    updated.name = "Exact amount v2".to_string();
    updated.criteria = vec![
        Criterion::new("amount", "equals"),
        Criterion::new("currency", "equals"),
        Criterion::new("reference", "equals_ignore_case"),
    ];
    app.store.update_matching_rule(&updated).await.unwrap();

    let fetched = app.store.get_matching_rule("rule_1").await.unwrap();
    assert_eq!(fetched.name, "Exact amount v2");
    assert_eq!(fetched.criteria.len(), 3);
    assert_eq!(fetched.created_at, created.created_at);
    assert!(fetched.updated_at > created.updated_at);

    let mut bad = fetched.clone();
    bad.criteria = vec![];
    let err = app.store.update_matching_rule(&bad).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn update_and_delete_are_not_found_for_missing_rules() {
    let app = spawn_app();

    let ghost = exact_rule("rule_ghost");
    let err = app.store.update_matching_rule(&ghost).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = app.store.delete_matching_rule("rule_ghost").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn delete_removes_the_rule() {
    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_1")).await.unwrap();

    app.store.delete_matching_rule("rule_1").await.unwrap();
    let err = app.store.get_matching_rule("rule_1").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = app.store.delete_matching_rule("rule_1").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn rules_list_in_creation_order() {
    let app = spawn_app();
    for id in ["rule_a", "rule_b", "rule_c"] {
        app.store.record_matching_rule(&exact_rule(id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let rules = app.store.get_matching_rules().await.unwrap();
    let ids: Vec<&str> = rules.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["rule_a", "rule_b", "rule_c"]);
}
