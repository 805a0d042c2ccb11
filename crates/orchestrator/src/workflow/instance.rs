//! Workflow runtime state and its state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{WorkflowContext, WorkflowDefinition};
use crate::message::TenantId;

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal workflows never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Edges of the lifecycle graph
    ///
    /// A paused workflow only resumes or is cancelled; it must be running
    /// again before it can complete or fail.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Created, Running | Failed | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Rejected lifecycle change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("workflow {workflow_id}: invalid transition from {from} to {to}")]
pub struct InvalidStateTransition {
    pub workflow_id: Uuid,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
}

/// Why a workflow stopped in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Short machine-readable cause, e.g. `timeout` or `unresolved_input`
    pub kind: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} failed after {} attempt(s): {}",
            self.step_id, self.attempts, self.message
        )
    }
}

/// Runtime state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: String,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub status: WorkflowStatus,
    pub current_step_index: usize,
    pub context: WorkflowContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<StepFailure>,
}

impl WorkflowInstance {
    pub fn new(definition_id: impl Into<String>, tenant_id: TenantId, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            tenant_id,
            status: WorkflowStatus::Created,
            current_step_index: 0,
            context: WorkflowContext::new(input),
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    /// Move to `next`, stamping `completed_at` on terminal states
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), InvalidStateTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidStateTransition {
                workflow_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Fail with a recorded cause
    pub fn fail(&mut self, failure: StepFailure) -> Result<(), InvalidStateTransition> {
        self.transition(WorkflowStatus::Failed)?;
        self.last_error = Some(failure);
        Ok(())
    }

    /// Move past the current step (the index never goes backwards)
    pub fn advance(&mut self) {
        self.current_step_index += 1;
        self.updated_at = Utc::now();
    }
}

/// Persisted snapshot of an instance, with the definition it runs
///
/// `version` increases by one with every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub instance: WorkflowInstance,
    pub definition: WorkflowDefinition,
    pub version: u64,
    pub saved_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    pub fn workflow_id(&self) -> Uuid {
        self.instance.id
    }
}
