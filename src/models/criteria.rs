//! Rule criteria document and its typed, validated form.
//!
//! In storage a rule's criteria are an opaque JSON array of
//! `{field, operator, value?, tolerance?}` entries. In memory each entry is
//! compiled into a tagged operator variant so that evaluation is a total
//! function; anything the compiler does not recognize is rejected with
//! `InvalidInput` before the rule is ever persisted.

use crate::error::AppError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One criterion entry exactly as serialized in the rule document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Criterion {
    pub field: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<serde_json::Number>,
    /// Accepted in the document for compatibility, but its semantics are not
    /// specified; any non-null occurrence is rejected at validation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowable_drift: Option<serde_json::Number>,
}

impl Criterion {
    pub fn new(field: &str, operator: &str) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: None,
            tolerance: None,
            allowable_drift: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_tolerance(mut self, tolerance: serde_json::Number) -> Self {
        self.tolerance = Some(tolerance);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionField {
    Amount,
    Reference,
    Currency,
    Description,
    Date,
}

impl CriterionField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "amount" => Some(Self::Amount),
            "reference" => Some(Self::Reference),
            "currency" => Some(Self::Currency),
            "description" => Some(Self::Description),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringField {
    Reference,
    Currency,
    Description,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceMode {
    Absolute,
    Percent,
}

/// A validated criterion. Every variant carries everything evaluation needs,
/// so `evaluate` cannot fail at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledCriterion {
    AmountEquals,
    AmountWithinTolerance {
        mode: ToleranceMode,
        tolerance: Decimal,
    },
    DateEquals,
    DateWithin {
        tolerance_secs: i64,
    },
    StringEquals(StringField),
    StringEqualsIgnoreCase(StringField),
    StringContains(StringField),
    StringStartsWith(StringField),
    StringEndsWith(StringField),
    StringSimilar {
        field: StringField,
        threshold: f64,
    },
}

/// Validate and compile a full criteria list. A rule with no criteria is
/// rejected.
pub fn compile_criteria(criteria: &[Criterion]) -> Result<Vec<CompiledCriterion>, AppError> {
    if criteria.is_empty() {
        return Err(AppError::InvalidInput(anyhow::anyhow!(
            "a matching rule requires at least one criterion"
        )));
    }
    criteria.iter().map(compile_criterion).collect()
}

fn compile_criterion(criterion: &Criterion) -> Result<CompiledCriterion, AppError> {
    if criterion.allowable_drift.is_some() {
        return Err(invalid(format!(
            "allowable_drift is not supported on field '{}'",
            criterion.field
        )));
    }

    let field = CriterionField::parse(&criterion.field)
        .ok_or_else(|| invalid(format!("unknown criteria field '{}'", criterion.field)))?;

    match field {
        CriterionField::Amount => compile_amount(criterion),
        CriterionField::Date => compile_date(criterion),
        CriterionField::Reference => compile_string(criterion, StringField::Reference),
        CriterionField::Currency => compile_string(criterion, StringField::Currency),
        CriterionField::Description => compile_string(criterion, StringField::Description),
    }
}

fn compile_amount(criterion: &Criterion) -> Result<CompiledCriterion, AppError> {
    match criterion.operator.as_str() {
        "equals" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::AmountEquals)
        }
        "within_tolerance" => {
            let tolerance = required_tolerance(criterion)?;
            let tolerance = number_to_decimal(&tolerance)?;
            if tolerance <= Decimal::ZERO {
                return Err(invalid("amount tolerance must be positive".to_string()));
            }
            let mode = match &criterion.value {
                None => ToleranceMode::Absolute,
                Some(serde_json::Value::String(s)) if s == "absolute" => ToleranceMode::Absolute,
                Some(serde_json::Value::String(s)) if s == "percent" => ToleranceMode::Percent,
                Some(other) => {
                    return Err(invalid(format!(
                        "unknown amount tolerance mode '{}' (expected \"absolute\" or \"percent\")",
                        other
                    )))
                }
            };
            Ok(CompiledCriterion::AmountWithinTolerance { mode, tolerance })
        }
        op => Err(unknown_operator(op, "amount")),
    }
}

fn compile_date(criterion: &Criterion) -> Result<CompiledCriterion, AppError> {
    match criterion.operator.as_str() {
        "equals" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::DateEquals)
        }
        "within" => {
            let tolerance = required_tolerance(criterion)?;
            let secs = tolerance
                .as_i64()
                .ok_or_else(|| invalid("date tolerance must be whole seconds".to_string()))?;
            if secs <= 0 {
                return Err(invalid("date tolerance must be positive".to_string()));
            }
            if criterion.value.is_some() {
                return Err(invalid("date 'within' takes no value".to_string()));
            }
            Ok(CompiledCriterion::DateWithin {
                tolerance_secs: secs,
            })
        }
        op => Err(unknown_operator(op, "date")),
    }
}

fn compile_string(
    criterion: &Criterion,
    field: StringField,
) -> Result<CompiledCriterion, AppError> {
    match criterion.operator.as_str() {
        "equals" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::StringEquals(field))
        }
        "equals_ignore_case" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::StringEqualsIgnoreCase(field))
        }
        "contains" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::StringContains(field))
        }
        "starts_with" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::StringStartsWith(field))
        }
        "ends_with" => {
            reject_params(criterion)?;
            Ok(CompiledCriterion::StringEndsWith(field))
        }
        "similar" => {
            if criterion.tolerance.is_some() {
                return Err(invalid(
                    "'similar' takes its threshold in 'value', not 'tolerance'".to_string(),
                ));
            }
            let threshold = criterion
                .value
                .as_ref()
                .and_then(|v| v.as_f64())
                .ok_or_else(|| invalid("'similar' requires a numeric threshold".to_string()))?;
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(invalid(
                    "similarity threshold must be within (0, 1]".to_string(),
                ));
            }
            Ok(CompiledCriterion::StringSimilar { field, threshold })
        }
        op => Err(unknown_operator(op, &criterion.field)),
    }
}

fn reject_params(criterion: &Criterion) -> Result<(), AppError> {
    if criterion.tolerance.is_some() {
        return Err(invalid(format!(
            "operator '{}' takes no tolerance",
            criterion.operator
        )));
    }
    if criterion.value.is_some() {
        return Err(invalid(format!(
            "operator '{}' takes no value",
            criterion.operator
        )));
    }
    Ok(())
}

fn required_tolerance(criterion: &Criterion) -> Result<serde_json::Number, AppError> {
    criterion.tolerance.clone().ok_or_else(|| {
        invalid(format!(
            "operator '{}' requires a tolerance",
            criterion.operator
        ))
    })
}

/// Convert through the decimal string form so that a document tolerance of
/// `0.3` stays exactly `0.3` and boundary comparisons remain inclusive.
fn number_to_decimal(n: &serde_json::Number) -> Result<Decimal, AppError> {
    Decimal::from_str(&n.to_string())
        .map_err(|_| invalid(format!("tolerance '{}' is not a valid decimal", n)))
}

fn invalid(msg: String) -> AppError {
    AppError::InvalidInput(anyhow::anyhow!(msg))
}

fn unknown_operator(op: &str, field: &str) -> AppError {
    invalid(format!("unknown operator '{}' for field '{}'", op, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn num(v: &str) -> serde_json::Number {
        serde_json::from_str(v).unwrap()
    }

    #[test]
    fn compiles_the_documented_operator_set() {
        let criteria = vec![
            Criterion::new("amount", "equals"),
            Criterion::new("amount", "within_tolerance").with_tolerance(num("0.02")),
            Criterion::new("amount", "within_tolerance")
                .with_value(json!("percent"))
                .with_tolerance(num("0.01")),
            Criterion::new("date", "equals"),
            Criterion::new("date", "within").with_tolerance(num("86400")),
            Criterion::new("reference", "equals"),
            Criterion::new("currency", "equals_ignore_case"),
            Criterion::new("description", "contains"),
            Criterion::new("reference", "starts_with"),
            Criterion::new("reference", "ends_with"),
            Criterion::new("description", "similar").with_value(json!(0.85)),
        ];
        let compiled = compile_criteria(&criteria).unwrap();
        assert_eq!(compiled.len(), criteria.len());
        assert_eq!(
            compiled[1],
            CompiledCriterion::AmountWithinTolerance {
                mode: ToleranceMode::Absolute,
                tolerance: Decimal::from_str("0.02").unwrap(),
            }
        );
        assert_eq!(
            compiled[2],
            CompiledCriterion::AmountWithinTolerance {
                mode: ToleranceMode::Percent,
                tolerance: Decimal::from_str("0.01").unwrap(),
            }
        );
        assert_eq!(compiled[4], CompiledCriterion::DateWithin {
            tolerance_secs: 86_400
        });
    }

    #[test]
    fn rejects_empty_criteria() {
        let err = compile_criteria(&[]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn rejects_unknown_field_and_operator() {
        let err = compile_criteria(&[Criterion::new("memo", "equals")]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[Criterion::new("amount", "approximately")]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[Criterion::new("description", "regex")]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn rejects_allowable_drift() {
        let mut criterion = Criterion::new("reference", "equals");
        criterion.allowable_drift = Some(num("0.5"));
        let err = compile_criteria(&[criterion]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn rejects_missing_or_bad_parameters() {
        let err =
            compile_criteria(&[Criterion::new("amount", "within_tolerance")]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[
            Criterion::new("amount", "equals").with_tolerance(num("0.02"))
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[
            Criterion::new("date", "within").with_tolerance(num("1.5"))
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[
            Criterion::new("description", "similar").with_value(json!(0.0))
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let err = compile_criteria(&[
            Criterion::new("description", "similar").with_value(json!(1.2))
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn document_round_trips_through_json() {
        let criteria = vec![
            Criterion::new("amount", "within_tolerance")
                .with_value(json!("percent"))
                .with_tolerance(num("0.01")),
            Criterion::new("currency", "equals"),
        ];
        let doc = serde_json::to_value(&criteria).unwrap();
        let back: Vec<Criterion> = serde_json::from_value(doc).unwrap();
        assert_eq!(back, criteria);
    }

    #[test]
    fn unknown_document_keys_are_rejected() {
        let doc = json!([{"field": "amount", "operator": "equals", "weight": 2}]);
        assert!(serde_json::from_value::<Vec<Criterion>>(doc).is_err());
    }
}
