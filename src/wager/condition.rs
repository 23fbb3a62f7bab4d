//! Win Conditions
//!
//! Declarative win conditions and the pure evaluator that judges them
//! against extracted match statistics. All conditions on a wager combine
//! with AND-semantics: every condition must hold for the list to be
//! satisfied. `Custom` conditions are never machine-checkable and always
//! escalate to manual adjudication.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wager::stats::MatchStatistics;

/// What statistic a condition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionKind {
    /// Player eliminations.
    Kills,
    /// The player's team score.
    Score,
    /// Final placement (1-based, lower is better).
    Placement,
    /// Free-form condition, adjudicated by a human.
    Custom,
}

/// Comparison operator, written on the wire as the operator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Strictly greater.
    #[serde(rename = ">")]
    Gt,
    /// Greater or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Strictly less.
    #[serde(rename = "<")]
    Lt,
    /// Less or equal.
    #[serde(rename = "<=")]
    Le,
    /// Equal.
    #[serde(rename = "==")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    /// Apply the comparison to `lhs ? rhs`.
    pub fn compare(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
        }
    }

    /// Operator as written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

/// Condition target: numeric for machine-checkable kinds, text for `Custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    /// Numeric threshold.
    Numeric(i64),
    /// Free-form description of a custom condition.
    Text(String),
}

impl TargetValue {
    /// Numeric value, if this target is numeric.
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            TargetValue::Numeric(n) => Some(*n),
            TargetValue::Text(_) => None,
        }
    }
}

/// A single win condition on a wager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinCondition {
    /// Statistic being checked.
    pub kind: ConditionKind,
    /// Threshold (numeric) or free-form text (custom).
    pub target: TargetValue,
    /// Comparison operator.
    pub comparator: Comparator,
    /// Optional human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WinCondition {
    /// Shorthand for a numeric condition.
    pub fn numeric(kind: ConditionKind, comparator: Comparator, target: i64) -> Self {
        Self {
            kind,
            target: TargetValue::Numeric(target),
            comparator,
            description: None,
        }
    }

    /// A custom condition that always requires manual adjudication.
    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Custom,
            target: TargetValue::Text(text.into()),
            comparator: Comparator::Eq,
            description: None,
        }
    }

    /// Check that a non-custom condition carries a numeric target.
    /// Custom targets are never validated here.
    pub fn validate(&self) -> Result<(), EvalError> {
        if self.kind != ConditionKind::Custom && self.target.as_numeric().is_none() {
            return Err(EvalError::NonNumericTarget { kind: self.kind });
        }
        Ok(())
    }
}

/// Result of evaluating a condition (or a whole condition list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionVerdict {
    /// Condition holds.
    Met,
    /// Condition definitively does not hold.
    Unmet,
    /// Cannot be machine-checked; a human must rule.
    NeedsAdjudication,
}

/// Evaluation failures: the condition references something the statistics
/// cannot answer. Distinct from an unmet condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Statistics do not carry the field this condition needs.
    #[error("statistics carry no {field} to check")]
    MissingField {
        /// Human name of the missing field.
        field: &'static str,
    },
    /// A non-custom condition was declared with a text target.
    #[error("target value for {kind:?} must be numeric")]
    NonNumericTarget {
        /// The offending condition kind.
        kind: ConditionKind,
    },
    /// The scoreboard attributes the performance to someone other than
    /// the claimant.
    #[error("statistics are attributed to {attributed}, not claimant {claimed}")]
    AttributionConflict {
        /// Who claimed the win.
        claimed: String,
        /// Who the statistics belong to.
        attributed: String,
    },
}

/// Evaluate a single condition against statistics.
///
/// Pure and deterministic. Range validation has already happened in the
/// sanity filter; this only resolves the field and compares.
pub fn evaluate(condition: &WinCondition, stats: &MatchStatistics) -> Result<ConditionVerdict, EvalError> {
    let target = match condition.kind {
        ConditionKind::Custom => return Ok(ConditionVerdict::NeedsAdjudication),
        _ => condition
            .target
            .as_numeric()
            .ok_or(EvalError::NonNumericTarget { kind: condition.kind })?,
    };

    let actual = match condition.kind {
        ConditionKind::Kills => stats.player_stats.kills as i64,
        ConditionKind::Score => stats
            .own_team_score()
            .ok_or(EvalError::MissingField { field: "team score" })?,
        ConditionKind::Placement => stats
            .player_stats
            .placement
            .map(|p| p as i64)
            .ok_or(EvalError::MissingField { field: "placement" })?,
        ConditionKind::Custom => unreachable!(),
    };

    if condition.comparator.compare(actual, target) {
        Ok(ConditionVerdict::Met)
    } else {
        Ok(ConditionVerdict::Unmet)
    }
}

/// Evaluate a full condition list with AND-semantics.
///
/// Any definitively unmet condition makes the whole list `Unmet`, custom
/// conditions notwithstanding. If nothing is unmet but a custom condition
/// is present, the verdict is `NeedsAdjudication` and the caller must not
/// auto-settle.
pub fn evaluate_all(
    conditions: &[WinCondition],
    stats: &MatchStatistics,
) -> Result<ConditionVerdict, EvalError> {
    let mut needs_adjudication = false;

    for condition in conditions {
        match evaluate(condition, stats)? {
            ConditionVerdict::Met => {}
            ConditionVerdict::Unmet => return Ok(ConditionVerdict::Unmet),
            ConditionVerdict::NeedsAdjudication => needs_adjudication = true,
        }
    }

    if needs_adjudication {
        Ok(ConditionVerdict::NeedsAdjudication)
    } else {
        Ok(ConditionVerdict::Met)
    }
}
