//! Declarative workflow definitions

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Condition, InputMapping, ValueRef};
use crate::reliability::RetryPolicy;
use crate::serde_util::duration_millis;

/// Default per-step timeout
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

fn default_step_timeout() -> Duration {
    DEFAULT_STEP_TIMEOUT
}

/// Error type for malformed definitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow definition {0} has no steps")]
    Empty(String),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step {step} references unknown step `{reference}`")]
    UnknownReference { step: String, reference: String },

    #[error("step {step} references `{reference}`, which does not run before it")]
    ForwardReference { step: String, reference: String },

    #[error("step id `{0}` is reserved")]
    ReservedStepId(String),
}

/// One unit of agent work within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the definition; keys the step's output in context
    pub id: String,

    /// Target agent name; requests go to `agent.<agent>`
    pub agent: String,

    /// Task type passed to the agent
    pub task_type: String,

    #[serde(default)]
    pub input_mapping: InputMapping,

    /// Absent means the step always runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Workflow-level retry of the whole step
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Upper bound on one attempt's request
    #[serde(with = "duration_millis", default = "default_step_timeout")]
    pub timeout: Duration,
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        agent: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            task_type: task_type.into(),
            input_mapping: InputMapping::default(),
            condition: None,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_input(mut self, mapping: InputMapping) -> Self {
        self.input_mapping = mapping;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Message type the step's requests are routed on
    pub fn message_type(&self) -> String {
        crate::agent::agent_message_type(&self.agent)
    }

    fn references(&self) -> impl Iterator<Item = &ValueRef> {
        self.input_mapping
            .references()
            .into_iter()
            .chain(self.condition.iter().flat_map(Condition::references))
    }
}

/// Ordered list of steps, identified by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn get_step(&self, index: usize) -> Option<&WorkflowStep> {
        self.steps.get(index)
    }

    /// Check step ids and that every reference points backwards
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.id.clone()));
        }

        let all: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for step in &self.steps {
            if step.id == super::INPUT_ROOT {
                return Err(DefinitionError::ReservedStepId(step.id.clone()));
            }

            for reference in step.references() {
                let Some(target) = reference.step_id() else {
                    continue;
                };
                if seen.contains(target) {
                    continue;
                }
                let err = if all.contains(target) {
                    DefinitionError::ForwardReference {
                        step: step.id.clone(),
                        reference: reference.to_string(),
                    }
                } else {
                    DefinitionError::UnknownReference {
                        step: step.id.clone(),
                        reference: reference.to_string(),
                    }
                };
                return Err(err);
            }

            if !seen.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
        }

        Ok(())
    }
}
