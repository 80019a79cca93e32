//! Paged batch driver.
//!
//! Streams the upload's external transactions page by page, drives rule
//! evaluation over the candidate index, flushes matches in bulk, and
//! checkpoints progress after every page. Matches are written before the
//! checkpoint: replaying a page after a crash is harmless because duplicate
//! pairs are skipped by the store's uniqueness constraint.

use crate::config::MatchingConfig;
use crate::error::AppError;
use crate::matcher::{evaluate, CompiledRule, Verdict};
use crate::models::{
    ExternalTransaction, InternalTransaction, Match, ReconciliationProgress, ReconciliationStatus,
};
use crate::reconciler::index::{CandidateIndex, IndexBounds};
use crate::services::metrics::{self, TRANSACTION_MATCHES};
use crate::services::store::Store;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How a driver invocation ended. Cancellation is cooperative and clean: the
/// run stays `running` with its progress persisted so the caller may resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { matched: i64, unmatched: i64 },
    Cancelled,
}

/// Mutable run state, restored from the progress checkpoint and the recorded
/// matches on resume.
struct DriverState {
    offset: i64,
    processed: i64,
    matched: i64,
    unmatched: i64,
    last_external_id: String,
    /// Internal ids already committed to a match in this run. Each internal
    /// transaction is consumed at most once.
    consumed: HashSet<String>,
    /// External ids that already have a recorded match; replayed pages count
    /// them without re-evaluating.
    matched_externals: HashSet<String>,
    rule_ids: Option<Vec<String>>,
    batch_size: Option<i64>,
    extra: serde_json::Map<String, serde_json::Value>,
}

struct PageOutcome {
    matches: Vec<Match>,
    page_consumed: HashSet<String>,
    matched_delta: i64,
    unmatched_delta: i64,
}

pub struct BatchDriver {
    store: Arc<dyn Store>,
    config: MatchingConfig,
}

impl BatchDriver {
    pub fn new(store: Arc<dyn Store>, config: MatchingConfig) -> Self {
        Self { store, config }
    }

    /// Run (or resume) one reconciliation to completion, cancellation, or
    /// failure. Transient store errors are retried with exponential backoff;
    /// exhausting the retry budget marks the run `failed` and leaves progress
    /// intact for a later `resume`.
    #[instrument(skip(self, rule_ids, cancel), fields(reconciliation_id = %reconciliation_id, upload_id = %upload_id))]
    pub async fn run(
        &self,
        reconciliation_id: &str,
        upload_id: &str,
        rule_ids: &[String],
        batch_size: i64,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AppError> {
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

        // Rule order determines precedence.
        let mut rules = Vec::with_capacity(rule_ids.len());
        for rule_id in rule_ids {
            let rule = self
                .with_retry("get_matching_rule", || {
                    self.store.get_matching_rule(rule_id)
                })
                .await?;
            rules.push(CompiledRule::compile(&rule)?);
        }

        let mut state = self.restore_state(reconciliation_id).await?;
        let index = CandidateIndex::new(
            self.store.clone(),
            IndexBounds::from_rules(&rules),
            self.config.index_cache_capacity,
        );

        info!(
            page_offset = state.offset,
            matched = state.matched,
            unmatched = state.unmatched,
            "Driving reconciliation"
        );

        match self
            .run_loop(
                reconciliation_id,
                upload_id,
                batch_size,
                &rules,
                &index,
                &mut state,
                cancel,
            )
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if err.is_transient() {
                    warn!(error = %err, "Retry budget exhausted; marking reconciliation failed");
                    metrics::record_error("driver_retries_exhausted");
                    if let Err(mark_err) = self
                        .store
                        .update_reconciliation_status(
                            reconciliation_id,
                            ReconciliationStatus::Failed,
                            state.matched,
                            state.unmatched,
                        )
                        .await
                    {
                        error!(error = %mark_err, "Failed to record failed status");
                    }
                    metrics::record_reconciliation_operation("run", "failed");
                }
                Err(err)
            }
        }
    }

    async fn restore_state(&self, reconciliation_id: &str) -> Result<DriverState, AppError> {
        let progress = self
            .with_retry("load_progress", || {
                self.store.load_progress(reconciliation_id)
            })
            .await?;
        // The matches table is the source of truth; the consumed set and the
        // already-matched externals are rebuilt from it rather than trusted
        // to the checkpoint.
        let existing = self
            .with_retry("get_matches_by_reconciliation", || {
                self.store.get_matches_by_reconciliation(reconciliation_id)
            })
            .await?;
        Ok(DriverState {
            offset: progress.page_offset,
            processed: progress.processed_count,
            matched: progress.matched_count,
            unmatched: progress.unmatched_count,
            last_external_id: progress.last_processed_external_id,
            consumed: existing
                .iter()
                .map(|m| m.internal_transaction_id.clone())
                .collect(),
            matched_externals: existing
                .iter()
                .map(|m| m.external_transaction_id.clone())
                .collect(),
            rule_ids: progress.rule_ids,
            batch_size: progress.batch_size,
            extra: progress.extra,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        reconciliation_id: &str,
        upload_id: &str,
        batch_size: i64,
        rules: &[CompiledRule],
        index: &CandidateIndex,
        state: &mut DriverState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AppError> {
        loop {
            if cancel.is_cancelled() {
                info!(page_offset = state.offset, "Cancellation observed between pages");
                metrics::record_reconciliation_operation("run", "cancelled");
                return Ok(RunOutcome::Cancelled);
            }

            let offset = state.offset;
            let page = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(page_offset = offset, "Cancellation observed during page fetch");
                    metrics::record_reconciliation_operation("run", "cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                page = self.with_retry("get_external_transactions_paginated", || {
                    self.store
                        .get_external_transactions_paginated(upload_id, batch_size, offset)
                }) => page?,
            };

            let consumed = &state.consumed;
            let matched_externals = &state.matched_externals;
            let outcome = self
                .with_retry("process_page", || {
                    self.process_page(
                        reconciliation_id,
                        &page,
                        rules,
                        index,
                        consumed,
                        matched_externals,
                    )
                })
                .await?;

            // Matches first, then the checkpoint. A crash in between replays
            // the page; the uniqueness constraint makes the replay a no-op.
            self.with_retry("record_matches", || {
                self.store
                    .record_matches(reconciliation_id, &outcome.matches)
            })
            .await?;

            state.matched += outcome.matched_delta;
            state.unmatched += outcome.unmatched_delta;
            state.processed += page.len() as i64;
            state.offset += page.len() as i64;
            for m in &outcome.matches {
                state
                    .matched_externals
                    .insert(m.external_transaction_id.clone());
            }
            state.consumed.extend(outcome.page_consumed);
            if let Some(last) = page.last() {
                state.last_external_id = last.id.clone();
            }

            let progress = ReconciliationProgress {
                last_processed_external_id: state.last_external_id.clone(),
                processed_count: state.processed,
                matched_count: state.matched,
                unmatched_count: state.unmatched,
                page_offset: state.offset,
                rule_ids: state.rule_ids.clone(),
                batch_size: state.batch_size,
                extra: state.extra.clone(),
            };
            self.with_retry("save_progress", || {
                self.store.save_progress(reconciliation_id, &progress)
            })
            .await?;

            if (page.len() as i64) < batch_size {
                self.with_retry("update_reconciliation_status", || {
                    self.store.update_reconciliation_status(
                        reconciliation_id,
                        ReconciliationStatus::Completed,
                        state.matched,
                        state.unmatched,
                    )
                })
                .await?;
                info!(
                    matched = state.matched,
                    unmatched = state.unmatched,
                    "Reconciliation drained"
                );
                metrics::record_reconciliation_operation("run", "completed");
                return Ok(RunOutcome::Completed {
                    matched: state.matched,
                    unmatched: state.unmatched,
                });
            }
        }
    }

    /// Evaluate one page. Selections are returned, not applied, so a retried
    /// page starts from a clean slate.
    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        &self,
        reconciliation_id: &str,
        page: &[ExternalTransaction],
        rules: &[CompiledRule],
        index: &CandidateIndex,
        consumed: &HashSet<String>,
        matched_externals: &HashSet<String>,
    ) -> Result<PageOutcome, AppError> {
        let mut outcome = PageOutcome {
            matches: Vec::new(),
            page_consumed: HashSet::new(),
            matched_delta: 0,
            unmatched_delta: 0,
        };

        for external in page {
            if matched_externals.contains(&external.id) {
                outcome.matched_delta += 1;
                continue;
            }

            let candidates = index.candidates(external).await?;
            let selected = select_match(
                rules,
                external,
                &candidates,
                consumed,
                &outcome.page_consumed,
            );

            match selected {
                Some((rule_id, internal)) => {
                    outcome.page_consumed.insert(internal.id.clone());
                    outcome.matches.push(Match {
                        external_transaction_id: external.id.clone(),
                        internal_transaction_id: internal.id.clone(),
                        reconciliation_id: reconciliation_id.to_string(),
                        amount: external.amount,
                        date: external.date,
                    });
                    outcome.matched_delta += 1;
                    TRANSACTION_MATCHES.with_label_values(&[rule_id]).inc();
                }
                None => outcome.unmatched_delta += 1,
            }
        }

        Ok(outcome)
    }

    /// Bounded retry for store work. Only transient errors are retried; the
    /// policy is capped by the configured elapsed-time budget.
    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry_initial_backoff,
            max_elapsed_time: Some(self.config.retry_max_elapsed),
            ..ExponentialBackoff::default()
        };

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            operation,
                            error = %err,
                            backoff_ms = delay.as_millis() as u64,
                            "Transient store failure, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(operation, error = %err, "Store failure persisted past the retry budget");
                        return Err(err);
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}

/// Apply rule precedence and the tie-break: the first rule that matches any
/// candidate wins, and within that rule the highest score wins with the
/// lexicographically smallest internal id breaking ties.
fn select_match<'a>(
    rules: &'a [CompiledRule],
    external: &ExternalTransaction,
    candidates: &'a [InternalTransaction],
    consumed: &HashSet<String>,
    page_consumed: &HashSet<String>,
) -> Option<(&'a str, &'a InternalTransaction)> {
    for rule in rules {
        let mut best: Option<(f64, &InternalTransaction)> = None;
        for candidate in candidates {
            if consumed.contains(&candidate.id) || page_consumed.contains(&candidate.id) {
                continue;
            }
            if let Verdict::Match { score } = evaluate(rule, external, candidate) {
                let replace = match best {
                    None => true,
                    Some((best_score, best_candidate)) => {
                        score > best_score
                            || (score == best_score && candidate.id < best_candidate.id)
                    }
                };
                if replace {
                    best = Some((score, candidate));
                }
            }
        }
        if let Some((_, candidate)) = best {
            return Some((rule.rule_id.as_str(), candidate));
        }
    }
    None
}
