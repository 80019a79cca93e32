//! Domain models for the reconciliation core.

mod criteria;

pub use criteria::{
    compile_criteria, CompiledCriterion, Criterion, CriterionField, StringField, ToleranceMode,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Reconciliation Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One reconciliation run over one upload.
#[derive(Debug, Clone, FromRow)]
pub struct Reconciliation {
    pub reconciliation_id: String,
    pub upload_id: String,
    pub status: String,
    pub matched_transactions: i64,
    pub unmatched_transactions: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Reconciliation {
    pub fn new(reconciliation_id: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            reconciliation_id: reconciliation_id.into(),
            upload_id: upload_id.into(),
            status: ReconciliationStatus::Pending.as_str().to_string(),
            matched_transactions: 0,
            unmatched_transactions: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> ReconciliationStatus {
        ReconciliationStatus::from_str(&self.status)
    }
}

// ============================================================================
// Transaction Models
// ============================================================================

/// Externally sourced transaction (bank feed, PSP report), immutable after
/// ingestion.
#[derive(Debug, Clone, FromRow)]
pub struct ExternalTransaction {
    pub id: String,
    pub amount: Decimal,
    pub reference: String,
    pub currency: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub source: String,
    pub upload_id: String,
}

/// Transaction posted to the ledger by the host system. The core only reads
/// these.
#[derive(Debug, Clone, FromRow)]
pub struct InternalTransaction {
    pub id: String,
    pub amount: Decimal,
    pub reference: String,
    pub currency: String,
    pub description: String,
    pub date: DateTime<Utc>,
}

/// One committed pair. Amount and date are copied from the external side for
/// auditability.
#[derive(Debug, Clone, FromRow)]
pub struct Match {
    pub external_transaction_id: String,
    pub internal_transaction_id: String,
    pub reconciliation_id: String,
    pub amount: Decimal,
    pub date: DateTime<Utc>,
}

// ============================================================================
// Matching Rule Models
// ============================================================================

/// Reusable evaluator configuration. Criteria are AND-composed and validated
/// at insert/update time.
#[derive(Debug, Clone)]
pub struct MatchingRule {
    pub rule_id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub criteria: Vec<Criterion>,
}

// ============================================================================
// Progress Checkpoint
// ============================================================================

/// Resumable cursor into a run's external-transaction stream.
///
/// Persisted as an opaque document keyed by `reconciliation_id`; unknown
/// fields survive a save/load round-trip untouched. `rule_ids` and
/// `batch_size` carry the run parameters so a run can be resumed by id alone
/// after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationProgress {
    #[serde(default)]
    pub last_processed_external_id: String,
    #[serde(default)]
    pub processed_count: i64,
    #[serde(default)]
    pub matched_count: i64,
    #[serde(default)]
    pub unmatched_count: i64,
    #[serde(default)]
    pub page_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_defaults_to_pending() {
        for status in [
            ReconciliationStatus::Pending,
            ReconciliationStatus::Running,
            ReconciliationStatus::Completed,
            ReconciliationStatus::Failed,
        ] {
            assert_eq!(ReconciliationStatus::from_str(status.as_str()), status);
        }
        assert_eq!(
            ReconciliationStatus::from_str("bogus"),
            ReconciliationStatus::Pending
        );
    }

    #[test]
    fn progress_preserves_unknown_fields() {
        let doc = serde_json::json!({
            "last_processed_external_id": "ext_42",
            "processed_count": 300,
            "matched_count": 250,
            "unmatched_count": 50,
            "page_offset": 300,
            "operator_note": "left by a future version",
        });
        let progress: ReconciliationProgress = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(progress.page_offset, 300);
        assert_eq!(
            progress.extra.get("operator_note").and_then(|v| v.as_str()),
            Some("left by a future version")
        );
        let back = serde_json::to_value(&progress).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn empty_progress_is_the_default_sentinel() {
        let progress = ReconciliationProgress::default();
        assert_eq!(progress.page_offset, 0);
        assert_eq!(progress.processed_count, 0);
        assert!(progress.rule_ids.is_none());
    }
}
