//! Boolean step conditions evaluated against workflow context

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ValueRef, WorkflowContext};

/// Declarative predicate deciding whether a step runs
///
/// A reference that cannot be resolved (missing step, skipped step,
/// missing path) makes every predicate on it false, so `not(exists(..))`
/// is the way to branch on absence.
///
/// ```
/// use serde_json::json;
/// use switchyard_orchestrator::workflow::{Condition, WorkflowContext};
///
/// let mut ctx = WorkflowContext::new(json!({"kind": "email"}));
/// ctx.record_output("classify", json!({"urgent": true}), 1);
///
/// let cond = Condition::all(vec![
///     Condition::equals("input.kind", json!("email")),
///     Condition::truthy("classify.urgent"),
/// ]);
/// assert!(cond.evaluate(&ctx));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Exists { path: ValueRef },
    Truthy { path: ValueRef },
    Equals { path: ValueRef, value: Value },
    NotEquals { path: ValueRef, value: Value },
    GreaterThan { path: ValueRef, value: f64 },
    LessThan { path: ValueRef, value: f64 },
    /// Substring of a string, or element of an array
    Contains { path: ValueRef, value: Value },
    And { all: Vec<Condition> },
    Or { any: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn exists(path: impl Into<ValueRef>) -> Self {
        Self::Exists { path: path.into() }
    }

    pub fn truthy(path: impl Into<ValueRef>) -> Self {
        Self::Truthy { path: path.into() }
    }

    pub fn equals(path: impl Into<ValueRef>, value: Value) -> Self {
        Self::Equals {
            path: path.into(),
            value,
        }
    }

    pub fn not_equals(path: impl Into<ValueRef>, value: Value) -> Self {
        Self::NotEquals {
            path: path.into(),
            value,
        }
    }

    pub fn greater_than(path: impl Into<ValueRef>, value: f64) -> Self {
        Self::GreaterThan {
            path: path.into(),
            value,
        }
    }

    pub fn less_than(path: impl Into<ValueRef>, value: f64) -> Self {
        Self::LessThan {
            path: path.into(),
            value,
        }
    }

    pub fn contains(path: impl Into<ValueRef>, value: Value) -> Self {
        Self::Contains {
            path: path.into(),
            value,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::And { all: conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Or { any: conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate against the accumulated context
    pub fn evaluate(&self, ctx: &WorkflowContext) -> bool {
        let resolve = |path: &ValueRef| path.lookup(ctx).ok();

        match self {
            Self::Always => true,
            Self::Exists { path } => resolve(path).is_some(),
            Self::Truthy { path } => resolve(path).is_some_and(is_truthy),
            Self::Equals { path, value } => resolve(path).is_some_and(|v| v == value),
            Self::NotEquals { path, value } => resolve(path).is_some_and(|v| v != value),
            Self::GreaterThan { path, value } => resolve(path)
                .and_then(Value::as_f64)
                .is_some_and(|n| n > *value),
            Self::LessThan { path, value } => resolve(path)
                .and_then(Value::as_f64)
                .is_some_and(|n| n < *value),
            Self::Contains { path, value } => resolve(path).is_some_and(|v| match (v, value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            }),
            Self::And { all } => all.iter().all(|c| c.evaluate(ctx)),
            Self::Or { any } => any.iter().any(|c| c.evaluate(ctx)),
            Self::Not { condition } => !condition.evaluate(ctx),
        }
    }

    /// Every reference this condition reads
    pub fn references(&self) -> Vec<&ValueRef> {
        match self {
            Self::Always => vec![],
            Self::Exists { path }
            | Self::Truthy { path }
            | Self::Equals { path, .. }
            | Self::NotEquals { path, .. }
            | Self::GreaterThan { path, .. }
            | Self::LessThan { path, .. }
            | Self::Contains { path, .. } => vec![path],
            Self::And { all: conditions } | Self::Or { any: conditions } => {
                conditions.iter().flat_map(Condition::references).collect()
            }
            Self::Not { condition } => condition.references(),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
