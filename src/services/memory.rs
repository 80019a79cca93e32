//! In-memory store backend.
//!
//! Honors the full `Store` contract, including uniqueness constraints,
//! pagination ordering, and document serialization, so the hermetic test
//! suite and local tooling can run without a database.

use crate::error::AppError;
use crate::models::{
    compile_criteria, ExternalTransaction, InternalTransaction, Match, MatchingRule,
    Reconciliation, ReconciliationProgress, ReconciliationStatus,
};
use crate::services::store::{CandidateQuery, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Rule row as persisted: criteria held in serialized document form, exactly
/// like the relational backend.
#[derive(Debug, Clone)]
struct StoredRule {
    rule_id: String,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    criteria: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    reconciliations: HashMap<String, Reconciliation>,
    matches: Vec<Match>,
    match_keys: HashSet<(String, String)>,
    externals: Vec<ExternalTransaction>,
    internals: Vec<InternalTransaction>,
    rules: HashMap<String, StoredRule>,
    progress: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    paginated_calls: AtomicUsize,
    paginated_failures: Mutex<HashSet<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an internal ledger transaction. In production the posting engine
    /// owns these rows; the core only reads them.
    pub fn seed_internal_transaction(&self, tx: InternalTransaction) {
        self.lock().internals.push(tx);
    }

    /// Test support: make the n-th paginated fetch (1-based, counted across
    /// the store's lifetime) fail once with an `Internal` error.
    pub fn inject_paginated_failure(&self, call: usize) {
        self.paginated_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(call);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn rule_from_stored(stored: &StoredRule) -> Result<MatchingRule, AppError> {
        let criteria = serde_json::from_value(stored.criteria.clone())?;
        Ok(MatchingRule {
            rule_id: stored.rule_id.clone(),
            name: stored.name.clone(),
            description: stored.description.clone(),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            criteria,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_reconciliation(&self, rec: &Reconciliation) -> Result<(), AppError> {
        let mut inner = self.lock();
        if inner.reconciliations.contains_key(&rec.reconciliation_id) {
            return Err(AppError::AlreadyExists(anyhow::anyhow!(
                "Reconciliation '{}' already exists",
                rec.reconciliation_id
            )));
        }
        inner
            .reconciliations
            .insert(rec.reconciliation_id.clone(), rec.clone());
        Ok(())
    }

    async fn get_reconciliation(&self, id: &str) -> Result<Reconciliation, AppError> {
        self.lock().reconciliations.get(id).cloned().ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Reconciliation '{}' not found", id))
        })
    }

    async fn update_reconciliation_status(
        &self,
        id: &str,
        status: ReconciliationStatus,
        matched: i64,
        unmatched: i64,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        let rec = inner.reconciliations.get_mut(id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Reconciliation '{}' not found", id))
        })?;
        rec.status = status.as_str().to_string();
        rec.matched_transactions = matched;
        rec.unmatched_transactions = unmatched;
        match status {
            ReconciliationStatus::Running => {
                rec.started_at.get_or_insert_with(Utc::now);
                rec.completed_at = None;
            }
            ReconciliationStatus::Completed | ReconciliationStatus::Failed => {
                rec.completed_at = Some(Utc::now());
            }
            ReconciliationStatus::Pending => {}
        }
        Ok(())
    }

    async fn get_reconciliations_by_upload(
        &self,
        upload_id: &str,
    ) -> Result<Vec<Reconciliation>, AppError> {
        let mut recs: Vec<Reconciliation> = self
            .lock()
            .reconciliations
            .values()
            .filter(|r| r.upload_id == upload_id)
            .cloned()
            .collect();
        recs.sort_by(|a, b| {
            match (a.started_at, b.started_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            }
            .then_with(|| a.reconciliation_id.cmp(&b.reconciliation_id))
        });
        Ok(recs)
    }

    async fn record_matches(
        &self,
        reconciliation_id: &str,
        matches: &[Match],
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        for m in matches {
            let key = (
                reconciliation_id.to_string(),
                m.external_transaction_id.clone(),
            );
            if inner.match_keys.insert(key) {
                let mut m = m.clone();
                m.reconciliation_id = reconciliation_id.to_string();
                inner.matches.push(m);
            }
        }
        Ok(())
    }

    async fn record_match(&self, m: &Match) -> Result<(), AppError> {
        let mut inner = self.lock();
        let key = (
            m.reconciliation_id.clone(),
            m.external_transaction_id.clone(),
        );
        if inner.match_keys.insert(key) {
            inner.matches.push(m.clone());
        }
        Ok(())
    }

    async fn get_matches_by_reconciliation(&self, id: &str) -> Result<Vec<Match>, AppError> {
        let mut matches: Vec<Match> = self
            .lock()
            .matches
            .iter()
            .filter(|m| m.reconciliation_id == id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.external_transaction_id.cmp(&b.external_transaction_id));
        Ok(matches)
    }

    async fn record_external_transaction(
        &self,
        tx: &ExternalTransaction,
        upload_id: &str,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        if inner.externals.iter().any(|e| e.id == tx.id) {
            return Err(AppError::AlreadyExists(anyhow::anyhow!(
                "External transaction '{}' already exists",
                tx.id
            )));
        }
        let mut tx = tx.clone();
        tx.upload_id = upload_id.to_string();
        inner.externals.push(tx);
        Ok(())
    }

    async fn get_external_transactions_by_reconciliation(
        &self,
        id: &str,
    ) -> Result<Vec<ExternalTransaction>, AppError> {
        let inner = self.lock();
        let Some(rec) = inner.reconciliations.get(id) else {
            return Ok(Vec::new());
        };
        let mut txs: Vec<ExternalTransaction> = inner
            .externals
            .iter()
            .filter(|e| e.upload_id == rec.upload_id)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(txs)
    }

    async fn get_external_transactions_paginated(
        &self,
        upload_id: &str,
        batch_size: i64,
        offset: i64,
    ) -> Result<Vec<ExternalTransaction>, AppError> {
        let call = self.paginated_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .paginated_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&call)
        {
            return Err(AppError::Internal(anyhow::anyhow!(
                "injected storage failure on paginated fetch {}",
                call
            )));
        }

        let mut txs: Vec<ExternalTransaction> = self
            .lock()
            .externals
            .iter()
            .filter(|e| e.upload_id == upload_id)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(txs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(batch_size.max(0) as usize)
            .collect())
    }

    async fn record_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError> {
        compile_criteria(&rule.criteria)?;
        let criteria = serde_json::to_value(&rule.criteria)?;
        let mut inner = self.lock();
        if inner.rules.contains_key(&rule.rule_id) {
            return Err(AppError::AlreadyExists(anyhow::anyhow!(
                "Matching rule '{}' already exists",
                rule.rule_id
            )));
        }
        inner.rules.insert(
            rule.rule_id.clone(),
            StoredRule {
                rule_id: rule.rule_id.clone(),
                name: rule.name.clone(),
                description: rule.description.clone(),
                created_at: rule.created_at,
                updated_at: rule.updated_at,
                criteria,
            },
        );
        Ok(())
    }

    async fn get_matching_rules(&self) -> Result<Vec<MatchingRule>, AppError> {
        let inner = self.lock();
        let mut stored: Vec<&StoredRule> = inner.rules.values().collect();
        stored.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        stored.into_iter().map(Self::rule_from_stored).collect()
    }

    async fn get_matching_rule(&self, id: &str) -> Result<MatchingRule, AppError> {
        let inner = self.lock();
        let stored = inner
            .rules
            .get(id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Matching rule '{}' not found", id)))?;
        Self::rule_from_stored(stored)
    }

    async fn update_matching_rule(&self, rule: &MatchingRule) -> Result<(), AppError> {
        compile_criteria(&rule.criteria)?;
        let criteria = serde_json::to_value(&rule.criteria)?;
        let mut inner = self.lock();
        let stored = inner.rules.get_mut(&rule.rule_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Matching rule '{}' not found", rule.rule_id))
        })?;
        stored.name = rule.name.clone();
        stored.description = rule.description.clone();
        stored.criteria = criteria;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_matching_rule(&self, id: &str) -> Result<(), AppError> {
        let mut inner = self.lock();
        inner
            .rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Matching rule '{}' not found", id)))
    }

    async fn save_progress(
        &self,
        reconciliation_id: &str,
        progress: &ReconciliationProgress,
    ) -> Result<(), AppError> {
        let doc = serde_json::to_value(progress)?;
        self.lock()
            .progress
            .insert(reconciliation_id.to_string(), doc);
        Ok(())
    }

    async fn load_progress(
        &self,
        reconciliation_id: &str,
    ) -> Result<ReconciliationProgress, AppError> {
        match self.lock().progress.get(reconciliation_id) {
            Some(doc) => Ok(serde_json::from_value(doc.clone())?),
            None => Ok(ReconciliationProgress::default()),
        }
    }

    async fn get_internal_transactions_in_window(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<InternalTransaction>, AppError> {
        let mut txs: Vec<InternalTransaction> = self
            .lock()
            .internals
            .iter()
            .filter(|t| t.currency == query.currency)
            .filter(|t| query.amount_min.map_or(true, |min| t.amount >= min))
            .filter(|t| query.amount_max.map_or(true, |max| t.amount < max))
            .filter(|t| query.date_from.map_or(true, |from| t.date >= from))
            .filter(|t| query.date_to.map_or(true, |to| t.date < to))
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(txs)
    }
}
