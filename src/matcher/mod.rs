//! Rule evaluator.
//!
//! `evaluate` is a pure function of `(rule, external, internal)`: no clock,
//! locale, or randomness feeds a verdict, so repeated evaluation of the same
//! pair always yields the same result.

use crate::error::AppError;
use crate::models::{
    compile_criteria, CompiledCriterion, ExternalTransaction, InternalTransaction, MatchingRule,
    StringField, ToleranceMode,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Outcome of evaluating one rule against one candidate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    NoMatch,
    Match { score: f64 },
}

/// A matching rule with its criteria validated and ready to evaluate.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule_id: String,
    pub criteria: Vec<CompiledCriterion>,
}

impl CompiledRule {
    pub fn compile(rule: &MatchingRule) -> Result<Self, AppError> {
        Ok(Self {
            rule_id: rule.rule_id.clone(),
            criteria: compile_criteria(&rule.criteria)?,
        })
    }
}

/// Evaluate all criteria of a rule. Criteria are AND-composed: any failure is
/// `NoMatch`; otherwise the score is the arithmetic mean of per-criterion
/// scores, each boolean criterion contributing 1.0.
pub fn evaluate(
    rule: &CompiledRule,
    external: &ExternalTransaction,
    internal: &InternalTransaction,
) -> Verdict {
    let mut total = 0.0;
    for criterion in &rule.criteria {
        match criterion_score(criterion, external, internal) {
            Some(score) => total += score,
            None => return Verdict::NoMatch,
        }
    }
    Verdict::Match {
        score: total / rule.criteria.len() as f64,
    }
}

fn criterion_score(
    criterion: &CompiledCriterion,
    external: &ExternalTransaction,
    internal: &InternalTransaction,
) -> Option<f64> {
    match criterion {
        CompiledCriterion::AmountEquals => (external.amount == internal.amount).then_some(1.0),
        CompiledCriterion::AmountWithinTolerance { mode, tolerance } => {
            let diff = (external.amount - internal.amount).abs();
            let bound = match mode {
                ToleranceMode::Absolute => *tolerance,
                ToleranceMode::Percent => {
                    external.amount.abs().max(internal.amount.abs()) * *tolerance
                }
            };
            // Boundary is inclusive; degrade linearly from 1.0 at zero
            // difference to 0.0 at the bound.
            if diff > bound {
                return None;
            }
            if bound.is_zero() {
                return Some(1.0);
            }
            Some(linear_score(diff, bound))
        }
        CompiledCriterion::DateEquals => (external.date == internal.date).then_some(1.0),
        CompiledCriterion::DateWithin { tolerance_secs } => {
            let diff_ms = (external.date - internal.date).num_milliseconds().abs();
            let bound_ms = tolerance_secs * 1000;
            if diff_ms > bound_ms {
                return None;
            }
            Some(1.0 - diff_ms as f64 / bound_ms as f64)
        }
        CompiledCriterion::StringEquals(field) => {
            (string_of(external, *field) == string_of_internal(internal, *field)).then_some(1.0)
        }
        CompiledCriterion::StringEqualsIgnoreCase(field) => {
            let a = string_of(external, *field).to_lowercase();
            let b = string_of_internal(internal, *field).to_lowercase();
            (a == b).then_some(1.0)
        }
        CompiledCriterion::StringContains(field) => string_of(external, *field)
            .contains(string_of_internal(internal, *field))
            .then_some(1.0),
        CompiledCriterion::StringStartsWith(field) => string_of(external, *field)
            .starts_with(string_of_internal(internal, *field))
            .then_some(1.0),
        CompiledCriterion::StringEndsWith(field) => string_of(external, *field)
            .ends_with(string_of_internal(internal, *field))
            .then_some(1.0),
        CompiledCriterion::StringSimilar { field, threshold } => {
            let similarity = strsim::jaro_winkler(
                string_of(external, *field),
                string_of_internal(internal, *field),
            );
            (similarity >= *threshold).then_some(similarity)
        }
    }
}

fn linear_score(diff: Decimal, bound: Decimal) -> f64 {
    (Decimal::ONE - diff / bound).to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
}

fn string_of(tx: &ExternalTransaction, field: StringField) -> &str {
    match field {
        StringField::Reference => &tx.reference,
        StringField::Currency => &tx.currency,
        StringField::Description => &tx.description,
    }
}

fn string_of_internal(tx: &InternalTransaction, field: StringField) -> &str {
    match field {
        StringField::Reference => &tx.reference,
        StringField::Currency => &tx.currency,
        StringField::Description => &tx.description,
    }
}
