//! Reconciliation coordinator: run lifecycle, status transitions, and the
//! entry points callers use to create, start, and resume runs.

pub mod driver;
pub mod index;

pub use driver::{BatchDriver, RunOutcome};
pub use index::{CandidateIndex, IndexBounds};

use crate::config::MatchingConfig;
use crate::error::AppError;
use crate::models::{Reconciliation, ReconciliationProgress, ReconciliationStatus};
use crate::services::metrics;
use crate::services::store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct Reconciler {
    store: Arc<dyn Store>,
    config: MatchingConfig,
    driver: BatchDriver,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, config: MatchingConfig) -> Self {
        let driver = BatchDriver::new(store.clone(), config.clone());
        Self {
            store,
            config,
            driver,
        }
    }

    /// Create a run in `pending` with an assigned id.
    pub async fn create(
        &self,
        upload_id: &str,
        rule_ids: &[String],
        batch_size: i64,
    ) -> Result<String, AppError> {
        let id = Uuid::new_v4().to_string();
        self.create_with_id(&id, upload_id, rule_ids, batch_size)
            .await?;
        Ok(id)
    }

    /// Create a run in `pending` under a caller-supplied id.
    ///
    /// The run parameters are written into the initial progress checkpoint so
    /// that `start` and `resume` work from the id alone, including after a
    /// process restart.
    #[instrument(skip(self, rule_ids), fields(reconciliation_id = %id, upload_id = %upload_id))]
    pub async fn create_with_id(
        &self,
        id: &str,
        upload_id: &str,
        rule_ids: &[String],
        batch_size: i64,
    ) -> Result<(), AppError> {
        if batch_size <= 0 {
            return Err(AppError::InvalidInput(anyhow::anyhow!(
                "batch_size must be positive"
            )));
        }
        if batch_size > self.config.max_batch_size {
            return Err(AppError::InvalidInput(anyhow::anyhow!(
                "batch_size {} exceeds the configured maximum {}",
                batch_size,
                self.config.max_batch_size
            )));
        }
        if rule_ids.is_empty() {
            return Err(AppError::InvalidInput(anyhow::anyhow!(
                "a reconciliation requires at least one matching rule"
            )));
        }
        for rule_id in rule_ids {
            self.store.get_matching_rule(rule_id).await?;
        }

        let rec = Reconciliation::new(id, upload_id);
        self.store.record_reconciliation(&rec).await?;

        let progress = ReconciliationProgress {
            rule_ids: Some(rule_ids.to_vec()),
            batch_size: Some(batch_size),
            ..ReconciliationProgress::default()
        };
        self.store.save_progress(id, &progress).await?;

        metrics::record_reconciliation_operation("create", "ok");
        info!("Reconciliation created");
        Ok(())
    }

    /// Start a pending run and drive it until it completes, fails, or is
    /// cancelled. Idempotent: on a run that is already running, completed, or
    /// failed the current state is returned without mutation.
    #[instrument(skip(self, cancel), fields(reconciliation_id = %id))]
    pub async fn start(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Reconciliation, AppError> {
        let rec = self.store.get_reconciliation(id).await?;
        match rec.status() {
            ReconciliationStatus::Pending => self.run(rec, cancel).await,
            ReconciliationStatus::Running
            | ReconciliationStatus::Completed
            | ReconciliationStatus::Failed => Ok(rec),
        }
    }

    /// Resume a run from its last checkpoint. Valid from `running` (after a
    /// crash or cancellation) and `failed`; a `completed` run is returned
    /// unchanged.
    #[instrument(skip(self, cancel), fields(reconciliation_id = %id))]
    pub async fn resume(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Reconciliation, AppError> {
        let rec = self.store.get_reconciliation(id).await?;
        match rec.status() {
            ReconciliationStatus::Completed => Ok(rec),
            ReconciliationStatus::Running | ReconciliationStatus::Failed => {
                self.run(rec, cancel).await
            }
            ReconciliationStatus::Pending => Err(AppError::Conflict(anyhow::anyhow!(
                "reconciliation '{}' has not been started",
                id
            ))),
        }
    }

    /// The persisted run, verbatim.
    pub async fn status(&self, id: &str) -> Result<Reconciliation, AppError> {
        self.store.get_reconciliation(id).await
    }

    async fn run(
        &self,
        rec: Reconciliation,
        cancel: &CancellationToken,
    ) -> Result<Reconciliation, AppError> {
        let id = rec.reconciliation_id.clone();
        let progress = self.store.load_progress(&id).await?;
        let rule_ids = progress.rule_ids.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "run parameters for reconciliation '{}' are missing",
                id
            ))
        })?;
        let batch_size = progress
            .batch_size
            .unwrap_or(self.config.default_batch_size);

        self.store
            .update_reconciliation_status(
                &id,
                ReconciliationStatus::Running,
                rec.matched_transactions,
                rec.unmatched_transactions,
            )
            .await?;

        self.driver
            .run(&id, &rec.upload_id, &rule_ids, batch_size, cancel)
            .await?;

        self.store.get_reconciliation(&id).await
    }
}
