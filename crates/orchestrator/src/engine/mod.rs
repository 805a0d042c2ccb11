//! Workflow execution engine
//!
//! The engine module provides the [`WorkflowEngine`], which runs one step
//! loop per workflow instance, dispatching each step through the message
//! broker and checkpointing after every state change.

mod runner;
mod workflow_engine;

pub use workflow_engine::{EngineError, WorkflowEngine, WorkflowStatusView};
