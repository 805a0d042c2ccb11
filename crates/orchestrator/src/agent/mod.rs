//! Agent executors
//!
//! An agent performs one kind of work (transcription, extraction,
//! summarization) for workflow steps. The engine never calls agents
//! directly: each step becomes a request-response message on
//! `agent.<name>`, and [`bind_agent`] installs the executor as the only
//! handler for that type.
//!
//! Executors must be idempotent. The broker delivers at least once and the
//! engine re-runs the current step after recovery.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::broker::{
    BrokerError, HandlerError, HandlerResult, MessageBroker, MessageHandler, SubscribeOptions,
    SubscriptionId,
};
use crate::message::{AgentTask, Message, MessageId, MessagePattern, TenantId};

const AGENT_TYPE_PREFIX: &str = "agent.";

/// Message type an agent answers on
pub fn agent_message_type(agent: &str) -> String {
    format!("{AGENT_TYPE_PREFIX}{agent}")
}

/// What an executor knows about the step it is running
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub tenant_id: TenantId,

    /// Workflow-level attempt of the step (1-based)
    pub attempt: u32,

    /// Broker message carrying this task
    pub message_id: MessageId,
}

/// External worker performing one task type at a time
///
/// # Example
///
/// ```ignore
/// struct Transcriber;
///
/// #[async_trait]
/// impl AgentExecutor for Transcriber {
///     async fn execute(&self, ctx: &AgentContext, task_type: &str, input: Value) -> Result<Value, HandlerError> {
///         let file = input["file"].as_str().ok_or_else(|| HandlerError::new("missing file"))?;
///         Ok(json!({ "text": transcribe(file).await? }))
///     }
/// }
/// ```
#[async_trait]
pub trait AgentExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        ctx: &AgentContext,
        task_type: &str,
        input: Value,
    ) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into an [`AgentExecutor`]
pub struct FnAgent<F> {
    f: F,
}

impl<F> FnAgent<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AgentExecutor for FnAgent<F>
where
    F: Fn(AgentContext, String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &AgentContext,
        task_type: &str,
        input: Value,
    ) -> Result<Value, HandlerError> {
        (self.f)(ctx.clone(), task_type.to_string(), input).await
    }
}

/// Broker handler decoding [`AgentTask`] payloads for one executor
struct AgentHandler {
    agent: String,
    executor: Arc<dyn AgentExecutor>,
}

#[async_trait]
impl MessageHandler for AgentHandler {
    #[instrument(skip_all, fields(agent = %self.agent, message_id = %message.id))]
    async fn handle(&self, message: &Message) -> HandlerResult {
        let task: AgentTask = message.payload_as()?;
        let ctx = AgentContext {
            workflow_id: task.workflow_id,
            step_id: task.step_id,
            tenant_id: message.tenant_id.clone(),
            attempt: task.attempt,
            message_id: message.id,
        };

        debug!(
            workflow_id = %ctx.workflow_id,
            step_id = %ctx.step_id,
            task_type = %task.task_type,
            attempt = ctx.attempt,
            "executing agent task"
        );
        self.executor.execute(&ctx, &task.task_type, task.input).await
    }
}

/// Register `executor` as the request-response handler of `agent.<name>`
///
/// Fails with a duplicate handler error if the agent is already bound.
pub fn bind_agent(
    broker: &MessageBroker,
    name: &str,
    executor: Arc<dyn AgentExecutor>,
) -> Result<SubscriptionId, BrokerError> {
    let handler = AgentHandler {
        agent: name.to_string(),
        executor,
    };
    broker.subscribe_with(
        &agent_message_type(name),
        MessagePattern::RequestResponse,
        Arc::new(handler),
        SubscribeOptions::named(format!("agent:{name}")),
    )
}
