//! Workflow engine: start, status, lifecycle control and recovery

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::runner::{Control, ControlKind, Runner};
use crate::broker::MessageBroker;
use crate::config::EngineConfig;
use crate::message::TenantId;
use crate::substrate::{Pagination, StateStore, StoreError, WorkflowFilter};
use crate::workflow::{
    DefinitionError, InvalidStateTransition, StepFailure, WorkflowCheckpoint, WorkflowContext,
    WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};

const MAILBOX_CAPACITY: usize = 16;
const RECOVERY_PAGE: u32 = 100;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidStateTransition),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The submitted definition is malformed
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("workflow engine is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Read model of a workflow, built from its latest checkpoint
///
/// Context values under the engine's redact keys are masked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub workflow_id: Uuid,
    pub definition_id: String,
    pub tenant_id: TenantId,
    pub status: WorkflowStatus,
    pub current_step_index: usize,
    pub total_steps: usize,
    /// Id of the step at `current_step_index`, if any remain
    pub current_step: Option<String>,
    pub context: WorkflowContext,
    pub last_error: Option<StepFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl WorkflowStatusView {
    fn from_checkpoint(checkpoint: WorkflowCheckpoint, redact_keys: &[String]) -> Self {
        let WorkflowCheckpoint {
            instance,
            definition,
            version,
            ..
        } = checkpoint;
        let current_step = definition
            .get_step(instance.current_step_index)
            .map(|step| step.id.clone());

        Self {
            workflow_id: instance.id,
            definition_id: instance.definition_id,
            tenant_id: instance.tenant_id,
            status: instance.status,
            current_step_index: instance.current_step_index,
            total_steps: definition.steps.len(),
            current_step,
            context: instance.context.redacted(redact_keys),
            last_error: instance.last_error,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            completed_at: instance.completed_at,
            version,
        }
    }
}

pub(super) struct RunHandle {
    pub run_id: Uuid,
    pub control: mpsc::Sender<Control>,
}

pub(super) struct EngineInner {
    pub broker: MessageBroker,
    pub store: Arc<dyn StateStore>,
    pub config: EngineConfig,
    pub running: DashMap<Uuid, RunHandle>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

/// Executes workflow definitions step by step over the message broker
///
/// Every step is a request-response message to `agent.<name>`; bind
/// executors with [`bind_agent`](crate::agent::bind_agent). Each instance
/// runs on its own task, so distinct workflows proceed concurrently while
/// the steps of one workflow stay strictly sequential.
///
/// Status queries read the persisted checkpoint, never in-memory state.
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::new(broker.clone(), store, EngineConfig::default());
///
/// let definition = WorkflowDefinition::new("audio")
///     .step(WorkflowStep::new("transcribe", "speech", "transcribe"))
///     .step(
///         WorkflowStep::new("extract", "extractor", "entities")
///             .with_input(InputMapping::fields().field("text", "transcribe.text")),
///     );
///
/// let id = engine.start(definition, json!({"file": "a.wav"})).await?;
/// let status = engine.get_status(id).await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(broker: MessageBroker, store: Arc<dyn StateStore>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                broker,
                store,
                config,
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // =========================================================================
    // Starting workflows
    // =========================================================================

    /// Start a workflow for the default tenant
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        self.start_for_tenant(definition, input, TenantId::default())
            .await
    }

    /// Persist a new instance, mark it running and schedule its step loop
    ///
    /// Returns as soon as the instance is durably `running`; steps execute
    /// asynchronously.
    #[instrument(skip(self, definition, input), fields(definition_id = %definition.id))]
    pub async fn start_for_tenant(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
        tenant_id: TenantId,
    ) -> Result<Uuid, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        definition.validate()?;

        let instance = WorkflowInstance::new(definition.id.clone(), tenant_id, input);
        let workflow_id = instance.id;
        let mut checkpoint = WorkflowCheckpoint {
            instance,
            definition,
            version: 1,
            saved_at: Utc::now(),
        };
        self.inner.store.save_checkpoint(&checkpoint).await?;

        checkpoint.instance.transition(WorkflowStatus::Running)?;
        checkpoint.version += 1;
        checkpoint.saved_at = Utc::now();
        self.inner.store.save_checkpoint(&checkpoint).await?;

        info!(
            %workflow_id,
            tenant_id = %checkpoint.instance.tenant_id,
            steps = checkpoint.definition.steps.len(),
            "workflow started"
        );
        self.spawn(checkpoint);
        Ok(workflow_id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current status, step index and redacted context
    #[instrument(skip(self))]
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<WorkflowStatusView, EngineError> {
        let checkpoint = self.inner.store.load_checkpoint(workflow_id).await?;
        Ok(WorkflowStatusView::from_checkpoint(
            checkpoint,
            &self.inner.config.redact_keys,
        ))
    }

    /// List workflows from their checkpoints, oldest first
    #[instrument(skip(self))]
    pub async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowStatusView>, EngineError> {
        let checkpoints = self
            .inner
            .store
            .list_checkpoints(filter, pagination)
            .await?;
        Ok(checkpoints
            .into_iter()
            .map(|cp| WorkflowStatusView::from_checkpoint(cp, &self.inner.config.redact_keys))
            .collect())
    }

    /// Whether this engine currently runs a step loop for the workflow
    pub fn is_running(&self, workflow_id: Uuid) -> bool {
        self.inner.running.contains_key(&workflow_id)
    }

    // =========================================================================
    // Lifecycle control
    // =========================================================================

    /// `running → paused`; an in-flight step still records its output
    pub async fn pause(&self, workflow_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        self.control(workflow_id, ControlKind::Pause).await
    }

    /// `paused → running`
    pub async fn resume(&self, workflow_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        self.control(workflow_id, ControlKind::Resume).await
    }

    /// `running | paused → cancelled`
    ///
    /// An agent call already in flight is not aborted, its result is
    /// discarded when it arrives.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<WorkflowStatus, EngineError> {
        self.control(workflow_id, ControlKind::Cancel).await
    }

    #[instrument(skip(self))]
    async fn control(
        &self,
        workflow_id: Uuid,
        kind: ControlKind,
    ) -> Result<WorkflowStatus, EngineError> {
        let sender = self
            .inner
            .running
            .get(&workflow_id)
            .map(|handle| handle.control.clone());

        if let Some(sender) = sender {
            let (reply, response) = oneshot::channel();
            if sender.send(Control { kind, reply }).await.is_ok() {
                if let Ok(result) = response.await {
                    return result;
                }
            }
            debug!(%workflow_id, "runner exited before handling request");
        }

        self.control_stored(workflow_id, kind).await
    }

    /// Apply a transition directly to the checkpoint of a workflow that has
    /// no step loop in this process
    async fn control_stored(
        &self,
        workflow_id: Uuid,
        kind: ControlKind,
    ) -> Result<WorkflowStatus, EngineError> {
        let mut checkpoint = self.inner.store.load_checkpoint(workflow_id).await?;
        let target = kind.target();
        checkpoint.instance.transition(target)?;
        checkpoint.version += 1;
        checkpoint.saved_at = Utc::now();
        self.inner.store.save_checkpoint(&checkpoint).await?;

        info!(%workflow_id, status = %target, "workflow status changed");
        if target == WorkflowStatus::Running {
            self.spawn(checkpoint);
        }
        Ok(target)
    }

    // =========================================================================
    // Recovery and shutdown
    // =========================================================================

    /// Restart step loops for every non-terminal workflow in the store
    ///
    /// Each loop resumes at its checkpointed step index, re-running that
    /// step from its first attempt. Returns how many loops were started.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;

        for status in [
            WorkflowStatus::Created,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
        ] {
            let mut offset = 0;
            loop {
                let page = self
                    .inner
                    .store
                    .list_checkpoints(
                        WorkflowFilter::with_status(status),
                        Pagination::new(offset, RECOVERY_PAGE),
                    )
                    .await?;
                let fetched = page.len() as u32;
                // promoted checkpoints drop out of the `created` listing
                let mut promoted = 0;

                for mut checkpoint in page {
                    let workflow_id = checkpoint.workflow_id();
                    if self.is_running(workflow_id) {
                        continue;
                    }

                    if checkpoint.instance.status == WorkflowStatus::Created {
                        checkpoint.instance.transition(WorkflowStatus::Running)?;
                        checkpoint.version += 1;
                        checkpoint.saved_at = Utc::now();
                        if let Err(e) = self.inner.store.save_checkpoint(&checkpoint).await {
                            warn!(%workflow_id, error = %e, "failed to mark recovered workflow running");
                            continue;
                        }
                        promoted += 1;
                    }

                    debug!(
                        %workflow_id,
                        status = %checkpoint.instance.status,
                        step = checkpoint.instance.current_step_index,
                        "recovering workflow"
                    );
                    if self.spawn(checkpoint) {
                        recovered += 1;
                    }
                }

                if fetched < RECOVERY_PAGE {
                    break;
                }
                offset += fetched - promoted;
            }
        }

        info!(recovered, "workflow recovery complete");
        Ok(recovered)
    }

    /// Stop every step loop at its next suspension point
    ///
    /// Workflows keep their last checkpoint and continue after `recover`.
    pub async fn shutdown(&self) {
        info!(running = self.inner.running.len(), "shutting down workflow engine");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("workflow engine stopped");
    }

    fn spawn(&self, checkpoint: WorkflowCheckpoint) -> bool {
        let workflow_id = checkpoint.workflow_id();
        let run_id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        match self.inner.running.entry(workflow_id) {
            Entry::Occupied(_) => {
                debug!(%workflow_id, "workflow already has a runner");
                return false;
            }
            Entry::Vacant(entry) => {
                entry.insert(RunHandle {
                    run_id,
                    control: tx,
                });
            }
        }

        let runner = Runner::new(Arc::clone(&self.inner), run_id, checkpoint, rx);
        self.inner.tasks.spawn(runner.run());
        true
    }
}
