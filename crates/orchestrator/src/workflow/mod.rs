//! Workflow definitions and runtime state
//!
//! This module contains the declarative side of orchestration:
//! - [`WorkflowDefinition`] / [`WorkflowStep`] describing what runs
//! - [`InputMapping`] and [`Condition`] reading from [`WorkflowContext`]
//! - [`WorkflowInstance`] and its [`WorkflowStatus`] state machine
//! - [`WorkflowCheckpoint`], the persisted snapshot

mod condition;
mod context;
mod definition;
mod instance;
mod mapping;

pub use condition::Condition;
pub use context::{StepRecord, WorkflowContext, REDACTED};
pub use definition::{DefinitionError, WorkflowDefinition, WorkflowStep, DEFAULT_STEP_TIMEOUT};
pub use instance::{
    InvalidStateTransition, StepFailure, WorkflowCheckpoint, WorkflowInstance, WorkflowStatus,
};
pub use mapping::{InputMapping, InputSource, MappingError, Unresolved, ValueRef, INPUT_ROOT};
