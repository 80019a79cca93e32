//! Candidate index.
//!
//! Bounds the set of internal transactions evaluated per external
//! transaction so a run never degenerates into a full ledger scan per
//! record. Candidates are restricted by currency equality, a date window
//! derived from the run's rules, and coarse amount buckets covering the
//! widest amount tolerance around the external amount. Buckets are loaded
//! lazily from the store and cached for the run under an LRU budget.

use crate::error::AppError;
use crate::matcher::CompiledRule;
use crate::models::{CompiledCriterion, ExternalTransaction, InternalTransaction, ToleranceMode};
use crate::services::store::{CandidateQuery, Store};
use chrono::DateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Search-window bounds derived from the run's rule list.
///
/// The window must admit every pair some rule could match, so each dimension
/// takes the widest tolerance across rules; a rule that does not constrain a
/// dimension at all leaves that dimension unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBounds {
    /// Widest date tolerance in seconds; `None` when some rule carries no
    /// date criterion.
    pub date_window_secs: Option<i64>,
    /// Whether every rule constrains the amount. A percent tolerance of
    /// 100% or more reaches arbitrarily large internals, so it unbounds the
    /// dimension too.
    pub amount_bounded: bool,
    pub abs_tolerance: Decimal,
    pub pct_tolerance: Decimal,
    /// Base bucket width: the widest absolute tolerance, floored at one
    /// currency unit. Percent tolerances widen the effective width per
    /// external (see `CandidateIndex::bucket_scale`).
    pub bucket_width: Decimal,
}

impl IndexBounds {
    pub fn from_rules(rules: &[CompiledRule]) -> Self {
        let mut date_max: i64 = 0;
        let mut abs_tolerance = Decimal::ZERO;
        let mut pct_tolerance = Decimal::ZERO;
        let mut unbounded_date = rules.is_empty();
        let mut unbounded_amount = rules.is_empty();

        for rule in rules {
            let mut has_date = false;
            let mut has_amount = false;
            for criterion in &rule.criteria {
                match criterion {
                    CompiledCriterion::DateEquals => has_date = true,
                    CompiledCriterion::DateWithin { tolerance_secs } => {
                        has_date = true;
                        date_max = date_max.max(*tolerance_secs);
                    }
                    CompiledCriterion::AmountEquals => has_amount = true,
                    CompiledCriterion::AmountWithinTolerance { mode, tolerance } => {
                        has_amount = true;
                        match mode {
                            ToleranceMode::Absolute => {
                                abs_tolerance = abs_tolerance.max(*tolerance)
                            }
                            ToleranceMode::Percent => {
                                pct_tolerance = pct_tolerance.max(*tolerance)
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !has_date {
                unbounded_date = true;
            }
            if !has_amount {
                unbounded_amount = true;
            }
        }
        if pct_tolerance >= Decimal::ONE {
            unbounded_amount = true;
        }

        Self {
            date_window_secs: if unbounded_date { None } else { Some(date_max) },
            amount_bounded: !unbounded_amount,
            abs_tolerance,
            pct_tolerance,
            bucket_width: abs_tolerance.max(Decimal::ONE),
        }
    }
}

/// Cache key: currency, effective bucket width, amount bucket, date bucket.
/// Width zero and bucket 0 are the sentinels for an unbounded dimension.
type BucketKey = (String, Decimal, i64, i64);

struct BucketCache {
    capacity: usize,
    entries: HashMap<BucketKey, Arc<Vec<InternalTransaction>>>,
    order: VecDeque<BucketKey>,
}

impl BucketCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &BucketKey) -> Option<Arc<Vec<InternalTransaction>>> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: BucketKey, value: Arc<Vec<InternalTransaction>>) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        } else {
            self.touch(&key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn touch(&mut self, key: &BucketKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }
}

/// Per-run candidate lookup, read-only during a run.
pub struct CandidateIndex {
    store: Arc<dyn Store>,
    bounds: IndexBounds,
    cache: Mutex<BucketCache>,
}

impl CandidateIndex {
    pub fn new(store: Arc<dyn Store>, bounds: IndexBounds, cache_capacity: usize) -> Self {
        Self {
            store,
            bounds,
            cache: Mutex::new(BucketCache::new(cache_capacity)),
        }
    }

    pub fn bounds(&self) -> &IndexBounds {
        &self.bounds
    }

    /// The bounded set of internal transactions worth evaluating against
    /// `external`, ordered by id.
    pub async fn candidates(
        &self,
        external: &ExternalTransaction,
    ) -> Result<Vec<InternalTransaction>, AppError> {
        let span = self.amount_span(external);
        let (amount_buckets, width) = match span {
            Some(span) => {
                let width = self.bucket_scale(span);
                // One extra bucket each side covers tolerances that cross
                // bucket boundaries.
                let lo = bucket_of(external.amount - span, width) - 1;
                let hi = bucket_of(external.amount + span, width) + 1;
                ((lo..=hi).collect(), width)
            }
            None => (vec![0], Decimal::ZERO),
        };
        let window_ms = self.bounds.date_window_secs.map(|w| w * 1000);
        let date_buckets = match self.bounds.date_window_secs {
            Some(win) => {
                let width_ms = win.max(1) * 1000;
                let ts = external.date.timestamp_millis();
                let lo = (ts - win * 1000).div_euclid(width_ms);
                let hi = (ts + win * 1000).div_euclid(width_ms);
                (lo..=hi).collect()
            }
            None => vec![0],
        };

        let mut out: Vec<InternalTransaction> = Vec::new();
        for amount_bucket in &amount_buckets {
            for date_bucket in &date_buckets {
                let key = (
                    external.currency.clone(),
                    width,
                    *amount_bucket,
                    *date_bucket,
                );
                let bucket = self.load_bucket(key).await?;
                out.extend(bucket.iter().cloned());
            }
        }

        if let Some(span) = span {
            out.retain(|t| (t.amount - external.amount).abs() <= span);
        }
        if let Some(window_ms) = window_ms {
            out.retain(|t| (t.date - external.date).num_milliseconds().abs() <= window_ms);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out.dedup_by(|a, b| a.id == b.id);
        Ok(out)
    }

    /// Widest amount distance any rule can bridge from this external.
    ///
    /// The evaluator's percent bound scales with the larger side of the
    /// pair, so the window must reach internals up to `|e| / (1 - p)`: any
    /// pair with `|e - i| <= max(|e|, |i|) * p` also satisfies
    /// `|e - i| <= |e| * p / (1 - p)`.
    fn amount_span(&self, external: &ExternalTransaction) -> Option<Decimal> {
        if !self.bounds.amount_bounded {
            return None;
        }
        let pct = self.bounds.pct_tolerance;
        let pct_span = if pct.is_zero() {
            Decimal::ZERO
        } else {
            external.amount.abs() * pct / (Decimal::ONE - pct)
        };
        Some(self.bounds.abs_tolerance.max(pct_span))
    }

    /// Effective bucket width for one external: the base width doubled until
    /// it covers `span`, so a query touches a constant number of buckets no
    /// matter how large a percent tolerance grows with the amount. The width
    /// is part of the cache key, and externals of similar magnitude land on
    /// the same scale and share buckets.
    fn bucket_scale(&self, span: Decimal) -> Decimal {
        let mut width = self.bounds.bucket_width;
        let mut doublings = 0;
        while width < span && doublings < 96 {
            width *= Decimal::TWO;
            doublings += 1;
        }
        width
    }

    async fn load_bucket(
        &self,
        key: BucketKey,
    ) -> Result<Arc<Vec<InternalTransaction>>, AppError> {
        if let Some(hit) = self.lock_cache().get(&key) {
            return Ok(hit);
        }
        let query = self.bucket_query(&key);
        let rows = self.store.get_internal_transactions_in_window(&query).await?;
        let value = Arc::new(rows);
        self.lock_cache().insert(key, value.clone());
        Ok(value)
    }

    fn bucket_query(&self, key: &BucketKey) -> CandidateQuery {
        let (currency, width, amount_bucket, date_bucket) = key;
        let (amount_min, amount_max) = if width.is_zero() {
            (None, None)
        } else {
            (
                Some(Decimal::from(*amount_bucket) * *width),
                Some(Decimal::from(*amount_bucket + 1) * *width),
            )
        };
        let (date_from, date_to) = match self.bounds.date_window_secs {
            Some(win) => {
                let width_ms = win.max(1) * 1000;
                (
                    DateTime::from_timestamp_millis(date_bucket * width_ms),
                    DateTime::from_timestamp_millis((date_bucket + 1) * width_ms),
                )
            }
            None => (None, None),
        };
        CandidateQuery {
            currency: currency.clone(),
            amount_min,
            amount_max,
            date_from,
            date_to,
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, BucketCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn bucket_of(amount: Decimal, width: Decimal) -> i64 {
    (amount / width).floor().to_i64().unwrap_or(0)
}
