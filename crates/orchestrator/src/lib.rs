//! # Switchyard Orchestrator
//!
//! A message broker and workflow engine for coordinating agent workers.
//!
//! ## Features
//!
//! - **Four messaging patterns**: publish/subscribe, request/response, command and event
//! - **At-least-once delivery**: every message is written to a durable substrate before dispatch
//! - **Automatic retries**: per-type retry policies with exponential backoff and jitter
//! - **Dead letters**: messages that exhaust their budget are kept for inspection
//! - **Sequential workflows**: conditions, input mapping, step-level retries and checkpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (one step loop per instance, checkpoints after each step)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ request(agent.<name>)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MessageBroker                           │
//! │  (registry, per-key FIFO lanes, retries, correlation)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              SubstrateAdapter / StateStore                   │
//! │  (PostgreSQL in production, in-memory for tests)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use switchyard_orchestrator::prelude::*;
//!
//! let store = Arc::new(InMemoryStateStore::new());
//! let broker = MessageBroker::new(Arc::new(InMemorySubstrate::new()), store.clone(), BrokerConfig::default());
//! bind_agent(&broker, "speech", Arc::new(Transcriber))?;
//!
//! let engine = WorkflowEngine::new(broker.clone(), store, EngineConfig::default());
//! let definition = WorkflowDefinition::new("audio")
//!     .step(WorkflowStep::new("transcribe", "speech", "transcribe"));
//! let id = engine.start(definition, json!({"file": "a.wav"})).await?;
//! ```

mod serde_util;

pub mod agent;
pub mod broker;
pub mod config;
pub mod engine;
pub mod message;
pub mod reliability;
pub mod substrate;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::agent::{bind_agent, AgentContext, AgentExecutor, FnAgent};
    pub use crate::broker::{
        BrokerError, DeadLetterMessage, HandlerError, HandlerResult, MessageBroker,
        MessageHandler, SubscriptionId,
    };
    pub use crate::config::{BrokerConfig, EngineConfig, OrchestratorConfig};
    pub use crate::engine::{EngineError, WorkflowEngine, WorkflowStatusView};
    pub use crate::message::{Message, MessagePattern, MessageStatus, Priority, TenantId};
    pub use crate::reliability::RetryPolicy;
    pub use crate::substrate::{
        InMemoryStateStore, InMemorySubstrate, PostgresSubstrate, StateStore, SubstrateAdapter,
    };
    pub use crate::workflow::{
        Condition, InputMapping, WorkflowDefinition, WorkflowStatus, WorkflowStep,
    };
}

// Re-export key types at crate root
pub use agent::{bind_agent, AgentContext, AgentExecutor};
pub use broker::{BrokerError, HandlerError, MessageBroker};
pub use config::{BrokerConfig, EngineConfig, OrchestratorConfig};
pub use engine::{EngineError, WorkflowEngine};
pub use message::{Message, MessagePattern};
pub use reliability::RetryPolicy;
pub use substrate::{InMemoryStateStore, InMemorySubstrate, PostgresSubstrate};
pub use workflow::{WorkflowDefinition, WorkflowStatus, WorkflowStep};
