//! Persistence contract for the reconciliation core.

use crate::error::AppError;
use crate::models::{
    ExternalTransaction, InternalTransaction, Match, MatchingRule, Reconciliation,
    ReconciliationProgress, ReconciliationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Window filter for the internal-transaction read surface backing the
/// candidate index. `None` bounds leave that dimension unrestricted.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub currency: String,
    pub amount_min: Option<Decimal>,
    pub amount_max: Option<Decimal>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// Storage backend contract.
///
/// All multi-row mutations are atomic (commit-or-rollback). Point reads
/// observe their own prior writes. Implementations classify failures as
/// typed `AppError` kinds; classification by message text is not allowed.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new run. `AlreadyExists` if the id is taken.
    async fn record_reconciliation(&self, rec: &Reconciliation) -> Result<(), AppError>;

    /// `NotFound` if absent.
    async fn get_reconciliation(&self, id: &str) -> Result<Reconciliation, AppError>;

    /// Atomically set status and counters. Sets `started_at` on the first
    /// transition to running; `completed_at` is set on the terminal statuses
    /// and cleared when a run re-enters running. `NotFound` if zero rows are
    /// affected.
    async fn update_reconciliation_status(
        &self,
        id: &str,
        status: ReconciliationStatus,
        matched: i64,
        unmatched: i64,
    ) -> Result<(), AppError>;

    /// Runs for one upload, most recently started first.
    async fn get_reconciliations_by_upload(
        &self,
        upload_id: &str,
    ) -> Result<Vec<Reconciliation>, AppError>;

    /// Bulk-insert matches in one transaction. Pairs already recorded for
    /// the run are skipped, which makes page replay idempotent.
    async fn record_matches(
        &self,
        reconciliation_id: &str,
        matches: &[Match],
    ) -> Result<(), AppError>;

    /// Single insert with the same conflict semantics as the bulk path.
    async fn record_match(&self, m: &Match) -> Result<(), AppError>;

    async fn get_matches_by_reconciliation(&self, id: &str) -> Result<Vec<Match>, AppError>;

    async fn record_external_transaction(
        &self,
        tx: &ExternalTransaction,
        upload_id: &str,
    ) -> Result<(), AppError>;

    /// External transactions of the run's upload.
    async fn get_external_transactions_by_reconciliation(
        &self,
        id: &str,
    ) -> Result<Vec<ExternalTransaction>, AppError>;

    /// One page, ordered by `date` descending with `id` ascending as the
    /// tie-break. The ordering must be stable across calls so that a resumed
    /// run sees the same pages as an uninterrupted one.
    async fn get_external_transactions_paginated(
        &self,
        upload_id: &str,
        batch_size: i64,
        offset: i64,
    ) -> Result<Vec<ExternalTransaction>, AppError>;

    /// Insert a rule. Criteria are validated before anything is written;
    /// unknown fields or operators are `InvalidInput`.
    async fn record_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError>;

    async fn get_matching_rules(&self) -> Result<Vec<MatchingRule>, AppError>;

    async fn get_matching_rule(&self, id: &str) -> Result<MatchingRule, AppError>;

    /// Update name, description, and criteria; refreshes `updated_at`.
    /// `NotFound` if zero rows are affected.
    async fn update_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError>;

    /// `NotFound` if zero rows are affected.
    async fn delete_matching_rule(&self, id: &str) -> Result<(), AppError>;

    /// Upsert keyed by `reconciliation_id`, last writer wins.
    async fn save_progress(
        &self,
        reconciliation_id: &str,
        progress: &ReconciliationProgress,
    ) -> Result<(), AppError>;

    /// The saved checkpoint, or the empty sentinel when none exists yet
    /// (a first-time run is not an error).
    async fn load_progress(
        &self,
        reconciliation_id: &str,
    ) -> Result<ReconciliationProgress, AppError>;

    /// Internal transactions within the window, ordered by `id` ascending.
    async fn get_internal_transactions_in_window(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<InternalTransaction>, AppError>;
}
