//! PostgreSQL store backend.

use crate::error::AppError;
use crate::models::{
    compile_criteria, Criterion, ExternalTransaction, InternalTransaction, Match, MatchingRule,
    Reconciliation, ReconciliationProgress, ReconciliationStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{CandidateQuery, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, QueryBuilder};
use std::time::Duration;
use tracing::{info, instrument};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Rule row with the criteria document still serialized.
#[derive(Debug, Clone, FromRow)]
struct MatchingRuleRow {
    rule_id: String,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    criteria: serde_json::Value,
}

impl MatchingRuleRow {
    fn into_rule(self) -> Result<MatchingRule, AppError> {
        let criteria: Vec<Criterion> = serde_json::from_value(self.criteria)?;
        Ok(MatchingRule {
            rule_id: self.rule_id,
            name: self.name,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
            criteria,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    #[instrument(skip(self, rec), fields(reconciliation_id = %rec.reconciliation_id))]
    async fn record_reconciliation(&self, rec: &Reconciliation) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_reconciliation"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reconciliations (
                reconciliation_id, upload_id, status, matched_transactions,
                unmatched_transactions, started_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&rec.reconciliation_id)
        .bind(&rec.upload_id)
        .bind(&rec.status)
        .bind(rec.matched_transactions)
        .bind(rec.unmatched_transactions)
        .bind(rec.started_at)
        .bind(rec.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to record reconciliation"))?;

        timer.observe_duration();
        info!(reconciliation_id = %rec.reconciliation_id, "Reconciliation recorded");

        Ok(())
    }

    #[instrument(skip(self), fields(reconciliation_id = %id))]
    async fn get_reconciliation(&self, id: &str) -> Result<Reconciliation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_reconciliation"])
            .start_timer();

        let rec = sqlx::query_as::<_, Reconciliation>(
            r#"
            SELECT reconciliation_id, upload_id, status, matched_transactions,
                   unmatched_transactions, started_at, completed_at
            FROM reconciliations
            WHERE reconciliation_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve reconciliation"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Reconciliation '{}' not found", id))
        })?;

        timer.observe_duration();
        Ok(rec)
    }

    #[instrument(skip(self), fields(reconciliation_id = %id, status = %status.as_str()))]
    async fn update_reconciliation_status(
        &self,
        id: &str,
        status: ReconciliationStatus,
        matched: i64,
        unmatched: i64,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_reconciliation_status"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE reconciliations
            SET status = $2,
                matched_transactions = $3,
                unmatched_transactions = $4,
                started_at = CASE
                    WHEN $2 = 'running' THEN COALESCE(started_at, NOW())
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $2 IN ('completed', 'failed') THEN NOW()
                    WHEN $2 = 'running' THEN NULL
                    ELSE completed_at
                END
            WHERE reconciliation_id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(matched)
        .bind(unmatched)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to update reconciliation status"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Reconciliation '{}' not found",
                id
            )));
        }

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(upload_id = %upload_id))]
    async fn get_reconciliations_by_upload(
        &self,
        upload_id: &str,
    ) -> Result<Vec<Reconciliation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_reconciliations_by_upload"])
            .start_timer();

        let recs = sqlx::query_as::<_, Reconciliation>(
            r#"
            SELECT reconciliation_id, upload_id, status, matched_transactions,
                   unmatched_transactions, started_at, completed_at
            FROM reconciliations
            WHERE upload_id = $1
            ORDER BY started_at DESC NULLS LAST, reconciliation_id ASC
            "#,
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve reconciliations"))?;

        timer.observe_duration();
        Ok(recs)
    }

    #[instrument(skip(self, matches), fields(reconciliation_id = %reconciliation_id, count = matches.len()))]
    async fn record_matches(
        &self,
        reconciliation_id: &str,
        matches: &[Match],
    ) -> Result<(), AppError> {
        if matches.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_matches"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::from_sqlx(e, "Failed to start transaction"))?;

        let mut builder = QueryBuilder::new(
            "INSERT INTO matches (external_transaction_id, internal_transaction_id, \
             reconciliation_id, amount, date) ",
        );
        builder.push_values(matches, |mut row, m| {
            row.push_bind(&m.external_transaction_id)
                .push_bind(&m.internal_transaction_id)
                .push_bind(reconciliation_id)
                .push_bind(m.amount)
                .push_bind(m.date);
        });
        builder.push(" ON CONFLICT (reconciliation_id, external_transaction_id) DO NOTHING");

        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::from_sqlx(e, "Failed to batch insert matches"))?;

        tx.commit()
            .await
            .map_err(|e| AppError::from_sqlx(e, "Failed to commit matches"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, m), fields(external_transaction_id = %m.external_transaction_id))]
    async fn record_match(&self, m: &Match) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_match"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO matches (
                external_transaction_id, internal_transaction_id, reconciliation_id, amount, date
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (reconciliation_id, external_transaction_id) DO NOTHING
            "#,
        )
        .bind(&m.external_transaction_id)
        .bind(&m.internal_transaction_id)
        .bind(&m.reconciliation_id)
        .bind(m.amount)
        .bind(m.date)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to record match"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(reconciliation_id = %id))]
    async fn get_matches_by_reconciliation(&self, id: &str) -> Result<Vec<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_matches_by_reconciliation"])
            .start_timer();

        let matches = sqlx::query_as::<_, Match>(
            r#"
            SELECT external_transaction_id, internal_transaction_id, reconciliation_id,
                   amount, date
            FROM matches
            WHERE reconciliation_id = $1
            ORDER BY external_transaction_id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve matches"))?;

        timer.observe_duration();
        Ok(matches)
    }

    #[instrument(skip(self, tx), fields(external_transaction_id = %tx.id, upload_id = %upload_id))]
    async fn record_external_transaction(
        &self,
        tx: &ExternalTransaction,
        upload_id: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_external_transaction"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO external_transactions (
                id, amount, reference, currency, description, date, source, upload_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.amount)
        .bind(&tx.reference)
        .bind(&tx.currency)
        .bind(&tx.description)
        .bind(tx.date)
        .bind(&tx.source)
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to record external transaction"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(reconciliation_id = %id))]
    async fn get_external_transactions_by_reconciliation(
        &self,
        id: &str,
    ) -> Result<Vec<ExternalTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_external_transactions_by_reconciliation"])
            .start_timer();

        // Scoped through the run's upload: matches carry the run id directly,
        // external transactions do not.
        let txs = sqlx::query_as::<_, ExternalTransaction>(
            r#"
            SELECT et.id, et.amount, et.reference, et.currency, et.description,
                   et.date, et.source, et.upload_id
            FROM external_transactions et
            JOIN reconciliations r ON r.upload_id = et.upload_id
            WHERE r.reconciliation_id = $1
            ORDER BY et.date DESC, et.id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve external transactions"))?;

        timer.observe_duration();
        Ok(txs)
    }

    #[instrument(skip(self), fields(upload_id = %upload_id))]
    async fn get_external_transactions_paginated(
        &self,
        upload_id: &str,
        batch_size: i64,
        offset: i64,
    ) -> Result<Vec<ExternalTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_external_transactions_paginated"])
            .start_timer();

        // The secondary key keeps the ordering stable, which resumption
        // depends on.
        let txs = sqlx::query_as::<_, ExternalTransaction>(
            r#"
            SELECT id, amount, reference, currency, description, date, source, upload_id
            FROM external_transactions
            WHERE upload_id = $1
            ORDER BY date DESC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(upload_id)
        .bind(batch_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve external transactions"))?;

        timer.observe_duration();
        Ok(txs)
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id))]
    async fn record_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError> {
        compile_criteria(&rule.criteria)?;
        let criteria = serde_json::to_value(&rule.criteria)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_matching_rule"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO matching_rules (
                rule_id, name, description, created_at, updated_at, criteria
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&rule.rule_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .bind(criteria)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to record matching rule"))?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, "Matching rule recorded");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_matching_rules(&self) -> Result<Vec<MatchingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_matching_rules"])
            .start_timer();

        let rows = sqlx::query_as::<_, MatchingRuleRow>(
            r#"
            SELECT rule_id, name, description, created_at, updated_at, criteria
            FROM matching_rules
            ORDER BY created_at ASC, rule_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve matching rules"))?;

        timer.observe_duration();
        rows.into_iter().map(MatchingRuleRow::into_rule).collect()
    }

    #[instrument(skip(self), fields(rule_id = %id))]
    async fn get_matching_rule(&self, id: &str) -> Result<MatchingRule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_matching_rule"])
            .start_timer();

        let row = sqlx::query_as::<_, MatchingRuleRow>(
            r#"
            SELECT rule_id, name, description, created_at, updated_at, criteria
            FROM matching_rules
            WHERE rule_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve matching rule"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Matching rule '{}' not found", id)))?;

        timer.observe_duration();
        row.into_rule()
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id))]
    async fn update_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError> {
        compile_criteria(&rule.criteria)?;
        let criteria = serde_json::to_value(&rule.criteria)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_matching_rule"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE matching_rules
            SET name = $2, description = $3, criteria = $4, updated_at = NOW()
            WHERE rule_id = $1
            "#,
        )
        .bind(&rule.rule_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(criteria)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to update matching rule"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Matching rule '{}' not found",
                rule.rule_id
            )));
        }

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(rule_id = %id))]
    async fn delete_matching_rule(&self, id: &str) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_matching_rule"])
            .start_timer();

        let result = sqlx::query(
            r#"
            DELETE FROM matching_rules
            WHERE rule_id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to delete matching rule"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Matching rule '{}' not found",
                id
            )));
        }

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, progress), fields(reconciliation_id = %reconciliation_id))]
    async fn save_progress(
        &self,
        reconciliation_id: &str,
        progress: &ReconciliationProgress,
    ) -> Result<(), AppError> {
        let doc = serde_json::to_value(progress)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_progress"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reconciliation_progress (reconciliation_id, progress)
            VALUES ($1, $2)
            ON CONFLICT (reconciliation_id) DO UPDATE
            SET progress = EXCLUDED.progress
            "#,
        )
        .bind(reconciliation_id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to save reconciliation progress"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(reconciliation_id = %reconciliation_id))]
    async fn load_progress(
        &self,
        reconciliation_id: &str,
    ) -> Result<ReconciliationProgress, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_progress"])
            .start_timer();

        let doc: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT progress
            FROM reconciliation_progress
            WHERE reconciliation_id = $1
            "#,
        )
        .bind(reconciliation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to load reconciliation progress"))?;

        timer.observe_duration();
        match doc {
            Some((doc,)) => Ok(serde_json::from_value(doc)?),
            None => Ok(ReconciliationProgress::default()),
        }
    }

    #[instrument(skip(self, query), fields(currency = %query.currency))]
    async fn get_internal_transactions_in_window(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<InternalTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_internal_transactions_in_window"])
            .start_timer();

        let txs = sqlx::query_as::<_, InternalTransaction>(
            r#"
            SELECT id, amount, reference, currency, description, date
            FROM internal_transactions
            WHERE currency = $1
              AND ($2::numeric IS NULL OR amount >= $2)
              AND ($3::numeric IS NULL OR amount < $3)
              AND ($4::timestamptz IS NULL OR date >= $4)
              AND ($5::timestamptz IS NULL OR date < $5)
            ORDER BY id ASC
            "#,
        )
        .bind(&query.currency)
        .bind(query.amount_min)
        .bind(query.amount_max)
        .bind(query.date_from)
        .bind(query.date_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_sqlx(e, "Failed to retrieve internal transactions"))?;

        timer.observe_duration();
        Ok(txs)
    }
}
