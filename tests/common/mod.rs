//! Common test utilities for recon-core integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use recon_core::config::MatchingConfig;
use recon_core::models::{Criterion, ExternalTransaction, InternalTransaction, MatchingRule};
use recon_core::reconciler::Reconciler;
use recon_core::services::{MemoryStore, Store};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,recon_core=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Test application wrapper: a hermetic in-memory store plus the coordinator
/// built over it.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub reconciler: Reconciler,
}

pub fn spawn_app() -> TestApp {
    spawn_app_with_config(MatchingConfig::default())
}

pub fn spawn_app_with_config(config: MatchingConfig) -> TestApp {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone(), config);
    TestApp { store, reconciler }
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// A September 2024 instant; keeps test data compact.
pub fn date(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, day, hour, 0, 0).unwrap()
}

pub fn external(
    id: &str,
    amount: &str,
    currency: &str,
    at: DateTime<Utc>,
) -> ExternalTransaction {
    ExternalTransaction {
        id: id.to_string(),
        amount: dec(amount),
        reference: format!("REF-{}", id),
        currency: currency.to_string(),
        description: format!("statement line {}", id),
        date: at,
        source: "bank".to_string(),
        upload_id: String::new(),
    }
}

pub fn internal(
    id: &str,
    amount: &str,
    currency: &str,
    at: DateTime<Utc>,
) -> InternalTransaction {
    InternalTransaction {
        id: id.to_string(),
        amount: dec(amount),
        reference: format!("REF-{}", id),
        currency: currency.to_string(),
        description: format!("ledger posting {}", id),
        date: at,
    }
}

pub fn rule(id: &str, name: &str, criteria: Vec<Criterion>) -> MatchingRule {
    let now = Utc::now();
    MatchingRule {
        rule_id: id.to_string(),
        name: name.to_string(),
        description: format!("{} (test rule)", name),
        created_at: now,
        updated_at: now,
        criteria,
    }
}

/// Exact amount + exact currency.
pub fn exact_rule(id: &str) -> MatchingRule {
    rule(
        id,
        "Exact amount",
        vec![
            Criterion::new("amount", "equals"),
            Criterion::new("currency", "equals"),
        ],
    )
}

/// Absolute amount tolerance + exact currency.
pub fn tolerance_rule(id: &str, tolerance: &str) -> MatchingRule {
    let tolerance: serde_json::Number = serde_json::from_str(tolerance).unwrap();
    rule(
        id,
        "Amount tolerance",
        vec![
            Criterion::new("amount", "within_tolerance").with_tolerance(tolerance),
            Criterion::new("currency", "equals"),
        ],
    )
}

/// Seed one upload's external transactions.
pub async fn seed_externals(store: &MemoryStore, upload_id: &str, txs: &[ExternalTransaction]) {
    for tx in txs {
        store
            .record_external_transaction(tx, upload_id)
            .await
            .expect("seeding external transaction");
    }
}

pub fn seed_internals(store: &MemoryStore, txs: Vec<InternalTransaction>) {
    for tx in txs {
        store.seed_internal_transaction(tx);
    }
}
