//! Accumulated step outputs of one workflow instance

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder written over sensitive values in status views
pub const REDACTED: &str = "[REDACTED]";

/// What a step left in context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepRecord {
    Completed {
        output: Value,
        attempts: u32,
        completed_at: DateTime<Utc>,
    },
    Skipped {
        at: DateTime<Utc>,
    },
}

/// Workflow context: the initial input plus one entry per executed step
///
/// Only the step loop owning the instance writes to it. Recording a step
/// again replaces that step's entry and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub input: Value,
    #[serde(default)]
    steps: BTreeMap<String, StepRecord>,
}

impl WorkflowContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            steps: BTreeMap::new(),
        }
    }

    pub fn record_output(&mut self, step_id: impl Into<String>, output: Value, attempts: u32) {
        self.steps.insert(
            step_id.into(),
            StepRecord::Completed {
                output,
                attempts,
                completed_at: Utc::now(),
            },
        );
    }

    pub fn record_skipped(&mut self, step_id: impl Into<String>) {
        self.steps
            .insert(step_id.into(), StepRecord::Skipped { at: Utc::now() });
    }

    /// Output of a completed step
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        match self.steps.get(step_id) {
            Some(StepRecord::Completed { output, .. }) => Some(output),
            _ => None,
        }
    }

    pub fn is_skipped(&self, step_id: &str) -> bool {
        matches!(self.steps.get(step_id), Some(StepRecord::Skipped { .. }))
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, &StepRecord)> {
        self.steps.iter().map(|(id, record)| (id.as_str(), record))
    }

    /// Completed outputs keyed by step id, e.g. `{"transcribe": {...}}`
    pub fn outputs(&self) -> Value {
        Value::Object(
            self.steps
                .iter()
                .filter_map(|(id, record)| match record {
                    StepRecord::Completed { output, .. } => Some((id.clone(), output.clone())),
                    StepRecord::Skipped { .. } => None,
                })
                .collect(),
        )
    }

    /// Copy of this context with values under sensitive keys masked
    ///
    /// Keys match case-insensitively at any depth of the input and of every
    /// step output.
    pub fn redacted(&self, keys: &[String]) -> Self {
        let steps = self
            .steps
            .iter()
            .map(|(id, record)| {
                let record = match record {
                    StepRecord::Completed {
                        output,
                        attempts,
                        completed_at,
                    } => StepRecord::Completed {
                        output: redact_value(output, keys),
                        attempts: *attempts,
                        completed_at: *completed_at,
                    },
                    skipped => skipped.clone(),
                };
                (id.clone(), record)
            })
            .collect();

        Self {
            input: redact_value(&self.input, keys),
            steps,
        }
    }
}

fn redact_value(value: &Value, keys: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if keys.iter().any(|key| key.eq_ignore_ascii_case(k)) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(v, keys)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(v, keys)).collect()),
        other => other.clone(),
    }
}
