//! Per-instance step loop
//!
//! Each running workflow is owned by exactly one [`Runner`] task. The
//! runner holds the only mutable copy of the instance and applies pause,
//! resume and cancel requests from its mailbox, so context updates never
//! race with external callers.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::workflow_engine::{EngineError, EngineInner};
use crate::broker::BrokerError;
use crate::message::{AgentTask, Message, MessagePattern};
use crate::substrate::StoreError;
use crate::workflow::{StepFailure, WorkflowCheckpoint, WorkflowStatus, WorkflowStep};

/// Lifecycle request sent to a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ControlKind {
    Pause,
    Resume,
    Cancel,
}

impl ControlKind {
    pub fn target(self) -> WorkflowStatus {
        match self {
            Self::Pause => WorkflowStatus::Paused,
            Self::Resume => WorkflowStatus::Running,
            Self::Cancel => WorkflowStatus::Cancelled,
        }
    }
}

pub(super) struct Control {
    pub kind: ControlKind,
    pub reply: oneshot::Sender<Result<WorkflowStatus, EngineError>>,
}

enum Flow {
    Continue,
    Stop,
}

pub(super) struct Runner {
    engine: Arc<EngineInner>,
    run_id: Uuid,
    checkpoint: WorkflowCheckpoint,
    control: mpsc::Receiver<Control>,
}

impl Runner {
    pub fn new(
        engine: Arc<EngineInner>,
        run_id: Uuid,
        checkpoint: WorkflowCheckpoint,
        control: mpsc::Receiver<Control>,
    ) -> Self {
        Self {
            engine,
            run_id,
            checkpoint,
            control,
        }
    }

    pub async fn run(mut self) {
        let workflow_id = self.checkpoint.workflow_id();
        debug!(
            %workflow_id,
            definition_id = %self.checkpoint.instance.definition_id,
            step = self.checkpoint.instance.current_step_index,
            "workflow runner started"
        );

        self.drive().await;

        // queued requests are dropped; callers fall back to the checkpoint
        self.control.close();
        while self.control.try_recv().is_ok() {}
        let run_id = self.run_id;
        self.engine
            .running
            .remove_if(&workflow_id, |_, handle| handle.run_id == run_id);

        debug!(
            %workflow_id,
            status = %self.checkpoint.instance.status,
            "workflow runner stopped"
        );
    }

    async fn drive(&mut self) {
        loop {
            if self.checkpoint.instance.status.is_terminal() {
                return;
            }

            if let Flow::Stop = self.wait_while_paused().await {
                return;
            }

            let index = self.checkpoint.instance.current_step_index;
            let Some(step) = self.checkpoint.definition.get_step(index).cloned() else {
                self.complete().await;
                return;
            };

            if let Flow::Stop = self.run_step(&step).await {
                return;
            }
        }
    }

    async fn run_step(&mut self, step: &WorkflowStep) -> Flow {
        let workflow_id = self.checkpoint.workflow_id();

        if let Some(condition) = &step.condition {
            if !condition.evaluate(&self.checkpoint.instance.context) {
                debug!(%workflow_id, step_id = %step.id, "condition not met, skipping step");
                self.checkpoint.instance.context.record_skipped(&step.id);
                self.checkpoint.instance.advance();
                return self.persist().await;
            }
        }

        let timeout = if step.timeout.is_zero() {
            self.engine.config.default_step_timeout
        } else {
            step.timeout
        };
        let mut attempts = 0;

        loop {
            attempts += 1;

            let input = match step.input_mapping.resolve(&self.checkpoint.instance.context) {
                Ok(input) => input,
                Err(e) => {
                    return self
                        .fail_step(step, "unresolved_input", e.to_string(), attempts)
                        .await
                }
            };

            let task = AgentTask {
                workflow_id,
                step_id: step.id.clone(),
                task_type: step.task_type.clone(),
                input,
                attempt: attempts,
            };
            let payload = match serde_json::to_value(&task) {
                Ok(payload) => payload,
                Err(e) => return self.fail_step(step, "payload", e.to_string(), attempts).await,
            };
            let request = Message::new(step.message_type(), MessagePattern::RequestResponse, payload)
                .with_tenant(self.checkpoint.instance.tenant_id.clone())
                // a fresh lane per attempt, so a timed-out attempt still
                // running in its handler cannot hold up the retry
                .with_ordering_key(format!("{workflow_id}/{}/{attempts}", step.id));

            debug!(%workflow_id, step_id = %step.id, attempt = attempts, "dispatching step");
            let broker = self.engine.broker.clone();
            let call = async move { broker.request(request, timeout).await };
            let Some(result) = self.await_controlled(call).await else {
                return Flow::Stop;
            };

            let error = match result {
                Ok(reply) => {
                    self.checkpoint
                        .instance
                        .context
                        .record_output(&step.id, reply.payload, attempts);
                    self.checkpoint.instance.advance();
                    info!(%workflow_id, step_id = %step.id, attempts, "step completed");
                    return self.persist().await;
                }
                Err(error) => error,
            };

            if !step.retry_policy.has_attempts_remaining(attempts) {
                return self
                    .fail_step(step, failure_kind(&error), error.to_string(), attempts)
                    .await;
            }

            let delay = step.retry_policy.delay_for_attempt(attempts + 1);
            warn!(
                %workflow_id,
                step_id = %step.id,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "step failed, retrying"
            );

            if self.await_controlled(tokio::time::sleep(delay)).await.is_none() {
                return Flow::Stop;
            }
            if let Flow::Stop = self.wait_while_paused().await {
                return Flow::Stop;
            }
        }
    }

    /// Await `fut` while servicing the mailbox
    ///
    /// Returns `None` when the workflow was cancelled or the engine is
    /// shutting down; `fut` is dropped and any late result is discarded.
    async fn await_controlled<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        let shutdown = self.engine.shutdown.clone();

        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                _ = shutdown.cancelled() => return None,
                Some(control) = self.control.recv() => {
                    if let Flow::Stop = self.apply(control).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Apply queued requests, then block while the workflow is paused
    async fn wait_while_paused(&mut self) -> Flow {
        while let Ok(control) = self.control.try_recv() {
            if let Flow::Stop = self.apply(control).await {
                return Flow::Stop;
            }
        }

        let shutdown = self.engine.shutdown.clone();
        while self.checkpoint.instance.status == WorkflowStatus::Paused {
            tokio::select! {
                _ = shutdown.cancelled() => return Flow::Stop,
                control = self.control.recv() => {
                    let Some(control) = control else { return Flow::Stop };
                    if let Flow::Stop = self.apply(control).await {
                        return Flow::Stop;
                    }
                }
            }
        }

        if shutdown.is_cancelled() {
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn apply(&mut self, control: Control) -> Flow {
        let target = control.kind.target();
        if let Err(e) = self.checkpoint.instance.transition(target) {
            let _ = control.reply.send(Err(e.into()));
            return Flow::Continue;
        }

        match self.save().await {
            Ok(()) => {
                info!(
                    workflow_id = %self.checkpoint.workflow_id(),
                    status = %target,
                    "workflow status changed"
                );
                let _ = control.reply.send(Ok(target));
                if target.is_terminal() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            Err(e) => {
                error!(
                    workflow_id = %self.checkpoint.workflow_id(),
                    error = %e,
                    "failed to persist status change, stopping runner"
                );
                let _ = control.reply.send(Err(e.into()));
                Flow::Stop
            }
        }
    }

    async fn complete(&mut self) {
        let workflow_id = self.checkpoint.workflow_id();
        if let Err(e) = self.checkpoint.instance.transition(WorkflowStatus::Completed) {
            warn!(%workflow_id, error = %e, "cannot complete workflow");
            return;
        }
        if let Flow::Continue = self.persist().await {
            info!(%workflow_id, "workflow completed");
        }
    }

    async fn fail_step(
        &mut self,
        step: &WorkflowStep,
        kind: &str,
        message: String,
        attempts: u32,
    ) -> Flow {
        if let Flow::Stop = self.wait_while_paused().await {
            return Flow::Stop;
        }

        let failure = StepFailure {
            step_id: step.id.clone(),
            message,
            attempts,
            kind: kind.to_string(),
        };
        let workflow_id = self.checkpoint.workflow_id();
        warn!(%workflow_id, failure = %failure, "workflow failed");

        if let Err(e) = self.checkpoint.instance.fail(failure) {
            warn!(%workflow_id, error = %e, "cannot fail workflow");
            return Flow::Stop;
        }
        self.persist().await;
        Flow::Stop
    }

    async fn save(&mut self) -> Result<(), StoreError> {
        self.checkpoint.version += 1;
        self.checkpoint.saved_at = Utc::now();
        self.engine.store.save_checkpoint(&self.checkpoint).await
    }

    /// Save a checkpoint; a failed save stops the runner at the last
    /// persisted state, which `recover` resumes from
    async fn persist(&mut self) -> Flow {
        match self.save().await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!(
                    workflow_id = %self.checkpoint.workflow_id(),
                    version = self.checkpoint.version,
                    error = %e,
                    "failed to save checkpoint, stopping runner"
                );
                Flow::Stop
            }
        }
    }
}

fn failure_kind(error: &BrokerError) -> &str {
    match error {
        BrokerError::RequestTimeout { .. } => "timeout",
        BrokerError::HandlerFailed { error, .. } => {
            error.error_type.as_deref().unwrap_or("handler_error")
        }
        BrokerError::NoHandler { .. } => "no_handler",
        _ => "broker",
    }
}
