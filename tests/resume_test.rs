//! Crash, retry, cancellation, and resumption behavior.

mod common;

use common::*;
use recon_core::config::MatchingConfig;
use recon_core::error::AppError;
use recon_core::models::{ExternalTransaction, InternalTransaction, ReconciliationStatus};
use recon_core::services::Store;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 1,000 externals; every even-numbered one has an exactly matching internal
/// posting. Amounts are distinct so each external can match only its own
/// counterpart.
fn fixture() -> (Vec<ExternalTransaction>, Vec<InternalTransaction>) {
    let mut externals = Vec::new();
    let mut internals = Vec::new();
    for i in 0..1000u32 {
        let id = format!("ext_{:04}", i);
        let amount = format!("{}.17", 1000 + i);
        let at = date(1 + (i % 28), i % 24);
        externals.push(external(&id, &amount, "USD", at));
        if i % 2 == 0 {
            internals.push(internal(&format!("int_{:04}", i), &amount, "USD", at));
        }
    }
    (externals, internals)
}

async fn run_clean() -> Vec<(String, String)> {
    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_exact")).await.unwrap();
    let (externals, internals) = fixture();
    seed_externals(&app.store, "upload_big", &externals).await;
    seed_internals(&app.store, internals);

    app.reconciler
        .create_with_id("rec_clean", "upload_big", &["rule_exact".to_string()], 100)
        .await
        .unwrap();
    let rec = app
        .reconciler
        .start("rec_clean", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Completed);
    assert_eq!(rec.matched_transactions + rec.unmatched_transactions, 1000);

    pairs(&app.store, "rec_clean").await
}

async fn pairs(store: &recon_core::services::MemoryStore, id: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = store
        .get_matches_by_reconciliation(id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| (m.external_transaction_id, m.internal_transaction_id))
        .collect();
    pairs.sort();
    pairs
}

#[tokio::test]
async fn a_failed_run_resumes_to_the_same_result_as_a_clean_run() {
    let expected = run_clean().await;
    assert_eq!(expected.len(), 500);

    // No retry budget: the first injected failure kills the run.
    let config = MatchingConfig {
        retry_max_elapsed: Duration::ZERO,
        ..MatchingConfig::default()
    };
    let app = spawn_app_with_config(config);
    app.store.record_matching_rule(&exact_rule("rule_exact")).await.unwrap();
    let (externals, internals) = fixture();
    seed_externals(&app.store, "upload_big", &externals).await;
    seed_internals(&app.store, internals);

    app.reconciler
        .create_with_id("rec_crash", "upload_big", &["rule_exact".to_string()], 100)
        .await
        .unwrap();

    // Pages 1-3 land; the fourth page fetch dies.
    app.store.inject_paginated_failure(4);
    let err = app
        .reconciler
        .start("rec_crash", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));

    let rec = app.reconciler.status("rec_crash").await.unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Failed);
    assert!(rec.completed_at.is_some());
    let progress = app.store.load_progress("rec_crash").await.unwrap();
    assert_eq!(progress.page_offset, 300);
    assert_eq!(progress.processed_count, 300);

    let rec = app
        .reconciler
        .resume("rec_crash", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Completed);
    assert_eq!(rec.matched_transactions, 500);
    assert_eq!(rec.unmatched_transactions, 500);
    assert_eq!(pairs(&app.store, "rec_crash").await, expected);
}

#[tokio::test]
async fn a_replayed_page_converges_without_duplicates() {
    let expected = run_clean().await;

    // Simulate a crash between the match flush and the progress checkpoint:
    // some matches are already on disk while the checkpoint still points at
    // the start of the stream.
    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_exact")).await.unwrap();
    let (externals, internals) = fixture();
    seed_externals(&app.store, "upload_big", &externals).await;
    seed_internals(&app.store, internals);

    app.reconciler
        .create_with_id("rec_replay", "upload_big", &["rule_exact".to_string()], 100)
        .await
        .unwrap();

    let replayed: Vec<recon_core::models::Match> = expected
        .iter()
        .take(40)
        .map(|(ext, int)| recon_core::models::Match {
            external_transaction_id: ext.clone(),
            internal_transaction_id: int.clone(),
            reconciliation_id: "rec_replay".to_string(),
            amount: dec("0"),
            date: date(1, 0),
        })
        .collect();
    app.store.record_matches("rec_replay", &replayed).await.unwrap();

    let rec = app
        .reconciler
        .start("rec_replay", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Completed);
    assert_eq!(rec.matched_transactions, 500);
    assert_eq!(rec.unmatched_transactions, 500);
    assert_eq!(pairs(&app.store, "rec_replay").await, expected);
}

#[tokio::test]
async fn a_cancelled_run_stays_running_and_resumes_cleanly() {
    let expected = run_clean().await;

    let app = spawn_app();
    app.store.record_matching_rule(&exact_rule("rule_exact")).await.unwrap();
    let (externals, internals) = fixture();
    seed_externals(&app.store, "upload_big", &externals).await;
    seed_internals(&app.store, internals);

    app.reconciler
        .create_with_id("rec_cancel", "upload_big", &["rule_exact".to_string()], 100)
        .await
        .unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let rec = app.reconciler.start("rec_cancel", &cancelled).await.unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Running);
    assert!(rec.started_at.is_some());
    assert!(rec.completed_at.is_none());

    let rec = app
        .reconciler
        .resume("rec_cancel", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Completed);
    assert_eq!(pairs(&app.store, "rec_cancel").await, expected);
}

#[tokio::test]
async fn transient_store_failures_are_retried_within_the_budget() {
    let config = MatchingConfig {
        retry_initial_backoff: Duration::from_millis(10),
        retry_max_elapsed: Duration::from_secs(5),
        ..MatchingConfig::default()
    };
    let app = spawn_app_with_config(config);
    app.store.record_matching_rule(&exact_rule("rule_exact")).await.unwrap();
    seed_externals(
        &app.store,
        "upload_1",
        &[external("e1", "10.00", "USD", date(1, 12))],
    )
    .await;
    seed_internals(&app.store, vec![internal("i1", "10.00", "USD", date(1, 12))]);

    app.reconciler
        .create_with_id("rec_retry", "upload_1", &["rule_exact".to_string()], 100)
        .await
        .unwrap();

    // The first page fetch fails once; the retry succeeds.
    app.store.inject_paginated_failure(1);
    let rec = app
        .reconciler
        .start("rec_retry", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rec.status(), ReconciliationStatus::Completed);
    assert_eq!(rec.matched_transactions, 1);
}
